// ============================================================
// Layer 4 — Subword Vocabulary
// ============================================================
// A SentencePiece-style vocabulary backed by a serialized
// `tokenizers` model (tokenizer.json). On top of the base
// pieces it reserves `extra_ids` sentinel ids at the top of the
// id space; the highest id is <extra_id_0>, the next one down
// <extra_id_1>, and so on.
//
//   ids:  0 .. base_size             → pieces from the model
//         base_size .. vocab_size    → sentinels, counted from the top
//
// The runtime cannot read tokenizer.json. It gets the matching
// SentencePiece `.model` file when one is configured.

use anyhow::{anyhow, bail, Result};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokenizers::Tokenizer;

use crate::domain::config::{SentencePieceConfig, VocabularyConfig};
use crate::domain::traits::Vocabulary;

pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;

pub struct SentencePieceVocabulary {
    path:       PathBuf,
    model_file: Option<PathBuf>,
    tokenizer:  Tokenizer,
    base_size:  usize,
    extra_ids:  usize,
}

impl SentencePieceVocabulary {
    pub fn load(config: &SentencePieceConfig) -> Result<Self> {
        if let Some(model_file) = &config.model_file {
            if model_file.extension().and_then(|e| e.to_str()) != Some("model") {
                bail!(
                    "vocabulary model file '{}' must be a SentencePiece .model file",
                    model_file.display()
                );
            }
        }
        let tokenizer = Tokenizer::from_file(&config.path).map_err(|e| {
            anyhow!("Cannot load vocabulary from '{}': {e}", config.path.display())
        })?;
        let base_size = tokenizer.get_vocab_size(true);
        tracing::debug!(
            "Loaded vocabulary '{}' ({} pieces + {} extra ids)",
            config.path.display(),
            base_size,
            config.extra_ids
        );
        Ok(Self {
            path:       config.path.clone(),
            model_file: config.model_file.clone(),
            tokenizer,
            base_size,
            extra_ids:  config.extra_ids,
        })
    }

    fn sentinel(&self, id: u32) -> String {
        format!("<extra_id_{}>", self.vocab_size() - 1 - id as usize)
    }
}

impl fmt::Debug for SentencePieceVocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentencePieceVocabulary")
            .field("path", &self.path)
            .field("model_file", &self.model_file)
            .field("base_size", &self.base_size)
            .field("extra_ids", &self.extra_ids)
            .finish()
    }
}

impl Vocabulary for SentencePieceVocabulary {
    fn vocab_size(&self) -> usize {
        self.base_size + self.extra_ids
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenisation error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut pieces: Vec<String> = Vec::new();
        let mut run:    Vec<u32>    = Vec::new();

        for &id in ids {
            let id_usize = id as usize;
            if id_usize < self.base_size {
                run.push(id);
                continue;
            }
            if id_usize >= self.vocab_size() {
                bail!("token id {id} is outside the vocabulary (size {})", self.vocab_size());
            }
            if !run.is_empty() {
                pieces.push(self.decode_run(&run)?);
                run.clear();
            }
            pieces.push(self.sentinel(id));
        }
        if !run.is_empty() {
            pieces.push(self.decode_run(&run)?);
        }
        Ok(pieces.join(" "))
    }

    fn extra_ids(&self) -> usize {
        self.extra_ids
    }

    fn model_file(&self) -> Option<&Path> {
        self.model_file.as_deref()
    }
}

impl SentencePieceVocabulary {
    fn decode_run(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("Decode error: {e}"))
    }
}

// ─── VocabularyPair ───────────────────────────────────────────────────────────
/// The vocabularies for the inputs and targets roles. Most models
/// share one vocabulary between both.
#[derive(Debug, Clone)]
pub struct VocabularyPair {
    pub inputs:  Arc<dyn Vocabulary>,
    pub targets: Arc<dyn Vocabulary>,
}

impl VocabularyPair {
    pub fn shared(vocabulary: Arc<dyn Vocabulary>) -> Self {
        Self {
            inputs:  Arc::clone(&vocabulary),
            targets: vocabulary,
        }
    }

    pub fn split(inputs: Arc<dyn Vocabulary>, targets: Arc<dyn Vocabulary>) -> Self {
        Self { inputs, targets }
    }

    pub fn from_config(config: &VocabularyConfig) -> Result<Self> {
        match config {
            VocabularyConfig::Shared(c) => {
                Ok(Self::shared(Arc::new(SentencePieceVocabulary::load(c)?)))
            }
            VocabularyConfig::Split { inputs, targets } => Ok(Self::split(
                Arc::new(SentencePieceVocabulary::load(inputs)?),
                Arc::new(SentencePieceVocabulary::load(targets)?),
            )),
        }
    }

    /// Vocabulary used to encode a feature key
    pub fn for_feature(&self, key: &str) -> &Arc<dyn Vocabulary> {
        if key == "inputs" {
            &self.inputs
        } else {
            &self.targets
        }
    }
}

// ─── Test Fixtures ────────────────────────────────────────────────────────────
/// Writes a small word-level tokenizer.json for tests.
#[cfg(test)]
pub(crate) fn write_test_vocabulary(dir: &Path, name: &str, words: &[&str]) -> PathBuf {
    let mut vocab = serde_json::json!({ "<pad>": 0, "</s>": 1, "<unk>": 2 });
    for (i, word) in words.iter().enumerate() {
        vocab[*word] = serde_json::json!(i + 3);
    }
    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    });
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(&tokenizer_json).unwrap()).unwrap();
    path
}
