//! Reversible byte-transform pipelines.
//!
//! An encode pipeline runs `[compress, encrypt]`; its decode counterpart
//! runs the exact inverse, `[decrypt, decompress]`. The same pipelines
//! process chunk payloads and every persisted metadata object, so an
//! empty password with encryption enabled fails identically everywhere.

use serde::de::DeserializeOwned;
use serde::Serialize;

use cairn_types::Result;

use crate::compress::{self, Compression};
use crate::crypto::{self, CryptoEngine, Encryption};

/// One reversible byte transform.
trait Stage: Send + Sync {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>>;
}

struct CompressStage(Compression);

impl Stage for CompressStage {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress::compress(self.0, data)
    }
}

struct DecompressStage;

impl Stage for DecompressStage {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress::decompress(data)
    }
}

struct EncryptStage(Box<dyn CryptoEngine>);

impl Stage for EncryptStage {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.0.encrypt(data)
    }
}

struct DecryptStage(Box<dyn CryptoEngine>);

impl Stage for DecryptStage {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.0.decrypt(data)
    }
}

/// An ordered list of byte-transform stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Encode pipeline: compress, then encrypt.
    pub fn encode_pipeline(
        compression: Compression,
        encryption: Encryption,
        password: &str,
    ) -> Result<Self> {
        Ok(Self {
            stages: vec![
                Box::new(CompressStage(compression)),
                Box::new(EncryptStage(crypto::engine_for(encryption, password)?)),
            ],
        })
    }

    /// Decode pipeline: decrypt, then decompress. The decompressor
    /// dispatches on the embedded tag, so no compression argument.
    pub fn decode_pipeline(encryption: Encryption, password: &str) -> Result<Self> {
        Ok(Self {
            stages: vec![
                Box::new(DecryptStage(crypto::engine_for(encryption, password)?)),
                Box::new(DecompressStage),
            ],
        })
    }

    /// Run data through every stage in order, short-circuiting on error.
    pub fn process(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut current = data.to_vec();
        for stage in &self.stages {
            current = stage.process(&current)?;
        }
        Ok(current)
    }

    /// Serialize an object to MessagePack and run it through the pipeline.
    pub fn encode<T: Serialize>(&self, object: &T) -> Result<Vec<u8>> {
        let serialized = rmp_serde::to_vec(object)?;
        self.process(&serialized)
    }

    /// Run bytes through the pipeline and deserialize the result.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let processed = self.process(data)?;
        Ok(rmp_serde::from_slice(&processed)?)
    }
}

/// Fixed pipeline for persisted metadata objects (repository, snapshots,
/// chunk index): LZMA compression with AES encryption.
pub fn metadata_encode_pipeline(password: &str) -> Result<Pipeline> {
    Pipeline::encode_pipeline(Compression::Lzma, Encryption::Aes, password)
}

pub fn metadata_decode_pipeline(password: &str) -> Result<Pipeline> {
    Pipeline::decode_pipeline(Encryption::Aes, password)
}
