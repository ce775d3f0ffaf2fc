//! Merges irregular upstream batches into batches of a minimum size.

/// Iterator adapter produced by [`rebatch`].
pub struct Rebatch<I, T> {
    inner: I,
    min_batch_size: usize,
    pending: Vec<T>,
    current: Vec<T>,
    finished: bool,
}

/// Regroups `batches` so every emitted batch except the last holds at least
/// `min_batch_size` items.
///
/// A full batch is emitted one cycle late: it is held until the next batch fills up,
/// so an undersized tail is merged into the final emission rather than emitted alone.
/// An empty input yields exactly one empty batch. Upstream errors are forwarded as
/// soon as they arrive.
pub fn rebatch<I, T, E>(batches: I, min_batch_size: usize) -> Rebatch<I::IntoIter, T>
where
    I: IntoIterator<Item = Result<Vec<T>, E>>,
{
    Rebatch {
        inner: batches.into_iter(),
        min_batch_size: min_batch_size.max(1),
        pending: Vec::new(),
        current: Vec::new(),
        finished: false,
    }
}

impl<I, T, E> Iterator for Rebatch<I, T>
where
    I: Iterator<Item = Result<Vec<T>, E>>,
{
    type Item = Result<Vec<T>, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok(batch)) => {
                    self.current.extend(batch);
                    if self.current.len() >= self.min_batch_size {
                        let full = std::mem::take(&mut self.current);
                        let ready = std::mem::replace(&mut self.pending, full);
                        if !ready.is_empty() {
                            return Some(Ok(ready));
                        }
                    }
                }
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.finished = true;
                    let mut last = std::mem::take(&mut self.pending);
                    last.append(&mut self.current);
                    return Some(Ok(last));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::convert::Infallible;

    fn run(batches: Vec<Vec<u32>>, min: usize) -> Vec<Vec<u32>> {
        rebatch(batches.into_iter().map(Ok::<_, Infallible>), min)
            .map(|batch| batch.unwrap())
            .collect()
    }

    #[test]
    fn merges_small_batches() {
        let out = run(vec![vec![1, 2], vec![3], vec![4, 5, 6], vec![7], vec![8, 9]], 3);
        assert_eq!(out, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]);
    }

    #[test]
    fn small_tail_joins_the_lagged_batch() {
        let out = run(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]], 3);
        assert_eq!(out, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[test]
    fn empty_source_yields_one_empty_batch() {
        assert_eq!(run(vec![], 5), vec![Vec::<u32>::new()]);
    }

    #[test]
    fn undersized_stream_is_emitted_once() {
        assert_eq!(run(vec![vec![1], vec![2]], 10), vec![vec![1, 2]]);
    }

    #[test]
    fn errors_pass_through() {
        let input = vec![Ok(vec![1, 2]), Err("down"), Ok(vec![3, 4])];
        let out: Vec<_> = rebatch(input, 2).collect();
        assert_eq!(out, vec![Err("down"), Ok(vec![1, 2]), Ok(vec![3, 4])]);
    }

    proptest! {
        #[test]
        fn preserves_items_and_minimum_size(
            batches in proptest::collection::vec(
                proptest::collection::vec(any::<u32>(), 0..12), 0..24),
            min in 1usize..20,
        ) {
            let expected: Vec<u32> = batches.iter().flatten().copied().collect();
            let out = run(batches, min);
            prop_assert!(!out.is_empty());
            for batch in &out[..out.len() - 1] {
                prop_assert!(batch.len() >= min);
            }
            let flattened: Vec<u32> = out.into_iter().flatten().collect();
            prop_assert_eq!(flattened, expected);
        }
    }
}
