//! Ordered CTR layers over stored ciphertext.
//!
//! Layers are applied oldest first and must be peeled newest first. Keeping
//! them as an explicit list makes that LIFO order a checked property rather
//! than an index walk over a mutable buffer.

use crate::crypto::{ctr, CipherError, Iv128};
use crate::keys::KeyBytes;

use super::{layer_iv, AkesoHeader, HeaderError};

/// One CTR pass: a key and the IV it starts at.
#[derive(Clone, Debug)]
pub struct Layer {
    key: KeyBytes,
    iv: Iv128,
}

impl Layer {
    pub fn new(key: KeyBytes, iv: Iv128) -> Self {
        Self { key, iv }
    }

    pub fn iv(&self) -> Iv128 {
        self.iv
    }

    /// Apply (or, equivalently, remove) this layer in place.
    pub fn apply(&self, data: &mut [u8]) -> Result<(), CipherError> {
        ctr::apply_keystream(self.key.as_bytes(), &self.iv, data)
    }
}

/// The CTR layers physically present over an object's GCM ciphertext.
#[derive(Clone, Debug, Default)]
pub struct LayerPipeline {
    layers: Vec<Layer>,
}

impl LayerPipeline {
    /// Build the pipeline for the first `applied` layers of `header`.
    ///
    /// `applied` is normally `header.layer_count()`; it is one less while the
    /// newest virtual rotation has not been physically applied yet.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::LayerCount`] if `applied` exceeds the chain.
    pub fn from_header(header: &AkesoHeader, applied: usize) -> Result<Self, HeaderError> {
        if applied > header.layer_count() {
            return Err(HeaderError::LayerCount {
                applied,
                recorded: header.layer_count(),
            });
        }
        let layers = (1..=applied)
            .map(|i| Layer::new(header.deks()[i].clone(), layer_iv(header.base_iv(), i)))
            .collect();
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Append a layer on top of the existing ones.
    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Apply every layer, oldest first.
    pub fn apply_all(&self, data: &mut [u8]) -> Result<(), CipherError> {
        self.layers.iter().try_for_each(|layer| layer.apply(data))
    }

    /// Remove every layer, newest first.
    pub fn peel(&self, data: &mut [u8]) -> Result<(), CipherError> {
        self.layers.iter().rev().try_for_each(|layer| layer.apply(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_LEN;

    fn header(n: usize) -> AkesoHeader {
        let mut h = AkesoHeader::new(Iv128::random(), [0u8; TAG_LEN], KeyBytes::random());
        for _ in 1..n {
            h.push_dek(KeyBytes::random()).unwrap();
        }
        h
    }

    #[test]
    fn peel_undoes_apply_all() {
        let h = header(4);
        let pipeline = LayerPipeline::from_header(&h, 3).unwrap();
        assert_eq!(pipeline.len(), 3);

        let original = b"gcm ciphertext bytes".to_vec();
        let mut data = original.clone();
        pipeline.apply_all(&mut data).unwrap();
        assert_ne!(data, original);
        pipeline.peel(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn layer_ivs_follow_chain_index() {
        let h = header(3);
        let pipeline = LayerPipeline::from_header(&h, 2).unwrap();
        assert_eq!(pipeline.layers[0].iv(), h.base_iv());
        assert_eq!(pipeline.layers[1].iv(), h.base_iv().add(1));
    }

    #[test]
    fn partial_pipeline_matches_applied_prefix() {
        let h = header(3);
        let full = LayerPipeline::from_header(&h, 2).unwrap();
        let partial = LayerPipeline::from_header(&h, 1).unwrap();

        let original = vec![0x5Au8; 64];
        let mut one_layer = original.clone();
        partial.apply_all(&mut one_layer).unwrap();

        // Peeling the partial pipeline from a one-layer payload recovers it.
        let mut data = one_layer.clone();
        partial.peel(&mut data).unwrap();
        assert_eq!(data, original);

        // Peeling the full pipeline from the same payload does not.
        let mut wrong = one_layer;
        full.peel(&mut wrong).unwrap();
        assert_ne!(wrong, original);
    }

    #[test]
    fn rejects_more_layers_than_recorded() {
        let h = header(2);
        assert_eq!(
            LayerPipeline::from_header(&h, 2).unwrap_err(),
            HeaderError::LayerCount {
                applied: 2,
                recorded: 1
            }
        );
        assert!(LayerPipeline::from_header(&h, 0).unwrap().is_empty());
    }

    #[test]
    fn push_extends_on_top() {
        let h = header(2);
        let mut pipeline = LayerPipeline::from_header(&h, 1).unwrap();
        pipeline.push(Layer::new(KeyBytes::random(), h.base_iv().add(1)));
        assert_eq!(pipeline.len(), 2);
    }
}
