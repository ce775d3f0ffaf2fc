//! Sentence encoders that turn comment sentences into fixed-size vectors.

pub mod openai;

use anyhow::Result;

/// Black-box sentence encoder.
pub trait SentenceEncoder {
    /// Identifier of the model behind this encoder.
    fn model_name(&self) -> &str;

    /// Length of every vector returned by [`SentenceEncoder::encode`].
    fn dimensions(&self) -> usize;

    /// Encodes each sentence into one vector, in input order.
    fn encode(&self, sentences: &[&str]) -> Result<Vec<Vec<f32>>>;
}

impl<E: SentenceEncoder + ?Sized> SentenceEncoder for &E {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    fn encode(&self, sentences: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).encode(sentences)
    }
}
