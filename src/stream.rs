//! Lazy batch streams and the buffered tee that lets several stages read one stream.
//!
//! Every stage in the pipeline consumes and produces single-use iterators. When a
//! stage needs the same sequence twice (a fit pass followed by a transform pass, or a
//! copy kept aside for serialization) it splits the iterator with [`tee`]. The tee
//! pulls from upstream only when its leading branch asks for an item and keeps just
//! the items that some live branch has not read yet.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ndarray::Array2;

use crate::error::PipelineError;
use crate::source::StoryMeta;

/// Single-consumption stream of fallible batches.
pub type BatchStream<'a, T> = Box<dyn Iterator<Item = Result<T, PipelineError>> + 'a>;

/// One batch of vectors, one row per story.
pub type VectorBatch = Rc<Array2<f64>>;

/// Cluster labels aligned with a [`VectorBatch`].
pub type LabelBatch = Rc<Vec<usize>>;

/// Story metadata aligned with a [`VectorBatch`].
pub type MetaBatch = Rc<Vec<StoryMeta>>;

/// Splits `source` into `N` independent iterators that all observe the same
/// sequence of items.
///
/// Items are cloned once per branch, so batch payloads should be cheap to clone
/// (`Rc`-wrapped). Dropping a branch releases whatever it was holding back.
pub fn tee<I, const N: usize>(source: I) -> [Tee<I>; N]
where
    I: Iterator,
    I::Item: Clone,
{
    let shared = Rc::new(RefCell::new(TeeState {
        source,
        buffer: VecDeque::new(),
        offset: 0,
        cursors: vec![Some(0); N],
        exhausted: false,
    }));
    std::array::from_fn(|id| Tee {
        shared: Rc::clone(&shared),
        id,
    })
}

/// One branch of a [`tee`].
pub struct Tee<I: Iterator> {
    shared: Rc<RefCell<TeeState<I>>>,
    id: usize,
}

struct TeeState<I: Iterator> {
    source: I,
    // buffer[0] is the item at absolute position `offset`
    buffer: VecDeque<I::Item>,
    offset: usize,
    // `None` marks a dropped branch
    cursors: Vec<Option<usize>>,
    exhausted: bool,
}

impl<I: Iterator> TeeState<I> {
    fn trim(&mut self) {
        let slowest = self.cursors.iter().flatten().min().copied();
        let keep_from = slowest.unwrap_or(self.offset + self.buffer.len());
        while self.offset < keep_from && self.buffer.pop_front().is_some() {
            self.offset += 1;
        }
    }
}

impl<I: Iterator> Tee<I> {
    /// Number of items currently held for slower branches.
    pub fn buffered(&self) -> usize {
        self.shared.borrow().buffer.len()
    }

    /// Items this branch has yielded so far.
    pub fn position(&self) -> usize {
        self.shared.borrow().cursors[self.id].unwrap_or_default()
    }
}

impl<I> Iterator for Tee<I>
where
    I: Iterator,
    I::Item: Clone,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let mut state = self.shared.borrow_mut();
        let position = state.cursors[self.id]?;
        let index = position - state.offset;
        let item = if index < state.buffer.len() {
            state.buffer[index].clone()
        } else {
            if state.exhausted {
                return None;
            }
            match state.source.next() {
                Some(item) => {
                    let live = state.cursors.iter().flatten().count();
                    if live > 1 {
                        state.buffer.push_back(item.clone());
                    } else {
                        // sole reader: nothing to retain
                        state.offset += 1;
                    }
                    item
                }
                None => {
                    state.exhausted = true;
                    return None;
                }
            }
        };
        state.cursors[self.id] = Some(position + 1);
        state.trim();
        Some(item)
    }
}

impl<I: Iterator> Drop for Tee<I> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.try_borrow_mut() {
            state.cursors[self.id] = None;
            state.trim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::cell::Cell;

    #[test]
    fn branches_see_identical_sequences() {
        let [a, b, c] = tee(1..=5);
        assert_eq!(a.collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(c.collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(b.collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn source_is_pulled_on_demand_only() {
        let pulled = Cell::new(0);
        let source = (0..10).inspect(|_| pulled.set(pulled.get() + 1));
        let [mut a, mut b] = tee(source);

        assert_eq!(pulled.get(), 0);
        a.next();
        a.next();
        assert_eq!(pulled.get(), 2);
        b.next();
        assert_eq!(pulled.get(), 2);
    }

    #[test]
    fn buffer_holds_only_the_gap_between_cursors() {
        let [mut a, mut b] = tee(0..100);

        for _ in 0..10 {
            a.next();
        }
        assert_eq!(a.buffered(), 10);
        for _ in 0..4 {
            b.next();
        }
        assert_eq!(a.buffered(), 6);
        for _ in 0..6 {
            b.next();
        }
        assert_eq!(b.buffered(), 0);
        assert_eq!(b.position(), 10);
    }

    #[test]
    fn dropped_branch_stops_holding_items() {
        let [mut a, b] = tee(0..100);
        a.next();
        a.next();
        assert_eq!(a.buffered(), 2);
        drop(b);
        assert_eq!(a.buffered(), 0);
        assert_eq!(a.next(), Some(2));
        assert_eq!(a.buffered(), 0);
    }

    #[test]
    fn errors_replay_to_every_branch() {
        let source = vec![Ok(1), Err(PipelineError::InvalidConfig("boom".into())), Ok(2)];
        let [a, b] = tee(source.into_iter());
        let a: Vec<_> = a.map(|item| item.is_ok()).collect();
        let b: Vec<_> = b.map(|item| item.is_ok()).collect();
        assert_eq!(a, vec![true, false, true]);
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn interleaved_reads_preserve_order(
            items in proptest::collection::vec(any::<u16>(), 0..64),
            schedule in proptest::collection::vec(0usize..3, 0..256),
        ) {
            let mut branches: [_; 3] = tee(items.clone().into_iter());
            let mut seen = vec![Vec::new(), Vec::new(), Vec::new()];
            for pick in schedule {
                if let Some(item) = branches[pick].next() {
                    seen[pick].push(item);
                }
            }
            for (branch, out) in branches.iter_mut().zip(seen.iter_mut()) {
                out.extend(branch.by_ref());
            }
            for out in seen {
                prop_assert_eq!(&out, &items);
            }
        }
    }
}
