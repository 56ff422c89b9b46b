//! Local emotion classifier
//!
//! A BERT sequence-classification checkpoint (Hugging Face layout) run with candle:
//! - `config.json` with `hidden_size` and `id2label`
//! - `tokenizer.json`
//! - `model.safetensors` or `pytorch_model.bin`
//!
//! [`EmotionService`] is the lazily initialised, process-wide handle the gateway shares.

use crate::config::EmotionConfig;
use crate::errors::{AppError, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};
use tokio::sync::OnceCell;

/// Label returned when no model is installed
pub const UNKNOWN_EMOTION: &str = "unknown";

/// Classification-head fields of `config.json`
#[derive(Debug, Deserialize)]
struct HeadConfig {
    hidden_size: usize,
    id2label: HashMap<String, String>,
}

impl HeadConfig {
    /// Labels ordered by class id
    fn labels(&self) -> Result<Vec<String>> {
        let mut indexed = self
            .id2label
            .iter()
            .map(|(id, label)| {
                id.parse::<usize>()
                    .map(|id| (id, label.clone()))
                    .map_err(|_| AppError::Classifier {
                        message: format!("Invalid class id in id2label: {}", id),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        indexed.sort_by_key(|(id, _)| *id);

        let mut labels = Vec::with_capacity(indexed.len());
        for (id, label) in indexed {
            // Gaps get the Hugging Face placeholder name
            while labels.len() < id {
                labels.push(format!("LABEL_{}", labels.len()));
            }
            labels.push(label);
        }

        if labels.is_empty() {
            return Err(AppError::Classifier {
                message: "config.json has an empty id2label".to_string(),
            });
        }

        Ok(labels)
    }
}

/// Pretrained sequence classifier
pub struct EmotionClassifier {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    labels: Vec<String>,
    device: Device,
}

impl EmotionClassifier {
    /// Load the classifier and tokenizer from a model directory
    pub fn load(model_dir: &Path, max_length: usize) -> Result<Self> {
        tracing::info!(model_dir = %model_dir.display(), "Loading emotion classifier");

        let device = Device::cuda_if_available(0)?;

        let raw_config = std::fs::read_to_string(model_dir.join("config.json"))?;
        let bert_config: BertConfig = serde_json::from_str(&raw_config)?;
        let head: HeadConfig = serde_json::from_str(&raw_config)?;
        let labels = head.labels()?;

        let mut tokenizer =
            Tokenizer::from_file(model_dir.join("tokenizer.json")).map_err(|e| AppError::Classifier {
                message: format!("Failed to load tokenizer: {}", e),
            })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| AppError::Classifier {
                message: format!("Failed to configure truncation: {}", e),
            })?;
        tokenizer.with_padding(None);

        let vb = VarBuilder::from_tensors(load_weights(model_dir, &device)?, DType::F32, &device);

        let model = BertModel::load(vb.pp("bert"), &bert_config)?;
        let pooler = linear(head.hidden_size, head.hidden_size, vb.pp("bert.pooler.dense"))?;
        let classifier = linear(head.hidden_size, labels.len(), vb.pp("classifier"))?;

        tracing::info!(labels = ?labels, device = ?device, "Emotion classifier ready");

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            labels,
            device,
        })
    }

    /// Predict the most likely emotion label for a text
    pub fn predict(&self, text: &str) -> Result<String> {
        let encoding = self.tokenizer.encode(text, true).map_err(|e| AppError::Classifier {
            message: format!("Tokenization failed: {}", e),
        })?;

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // [CLS] token -> pooler -> classification head
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;

        let index = logits.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()? as usize;

        Ok(self
            .labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{}", index)))
    }
}

/// Read safetensors weights, falling back to a PyTorch checkpoint
fn load_weights(model_dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        return Ok(candle_core::safetensors::load(&safetensors, device)?);
    }

    let pytorch = model_dir.join("pytorch_model.bin");
    if pytorch.exists() {
        let mut weights = HashMap::new();
        for (name, tensor) in candle_core::pickle::read_all(&pytorch)? {
            weights.insert(name, tensor.to_device(device)?);
        }
        return Ok(weights);
    }

    Err(AppError::Classifier {
        message: format!("No model weights found in {}", model_dir.display()),
    })
}

/// Lazily loaded classifier shared by every request in the process
pub struct EmotionService {
    model_dir: PathBuf,
    max_length: usize,
    classifier: OnceCell<Arc<EmotionClassifier>>,
}

impl EmotionService {
    pub fn new(config: &EmotionConfig) -> Self {
        Self {
            model_dir: config.model_dir.clone(),
            max_length: config.max_length,
            classifier: OnceCell::new(),
        }
    }

    /// Whether a model directory is installed
    pub fn model_present(&self) -> bool {
        self.model_dir.is_dir()
    }

    /// Whether the classifier has been loaded
    pub fn is_loaded(&self) -> bool {
        self.classifier.initialized()
    }

    /// Classify a message.
    ///
    /// Returns [`UNKNOWN_EMOTION`] while no model directory exists. The absence is
    /// not cached, so a model installed later is picked up on the next call.
    pub async fn detect(&self, text: &str) -> Result<String> {
        if !self.model_present() {
            return Ok(UNKNOWN_EMOTION.to_string());
        }

        let classifier = self.classifier().await?;

        let text = text.to_string();
        let label = tokio::task::spawn_blocking(move || classifier.predict(&text)).await??;

        tracing::debug!(emotion = %label, "Emotion detected");
        Ok(label)
    }

    /// The shared classifier, loaded on first use
    async fn classifier(&self) -> Result<Arc<EmotionClassifier>> {
        let classifier = self
            .classifier
            .get_or_try_init(|| async {
                let model_dir = self.model_dir.clone();
                let max_length = self.max_length;
                let classifier = tokio::task::spawn_blocking(move || {
                    EmotionClassifier::load(&model_dir, max_length)
                })
                .await??;
                Ok::<_, AppError>(Arc::new(classifier))
            })
            .await?;

        Ok(classifier.clone())
    }
}
