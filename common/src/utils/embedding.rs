use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use tracing::debug;

use crate::{config::scoped::EmbeddingSettings, error::AppError};

/// Query/document embedding backend.
///
/// `OpenAi` calls the configured embedding model (batch-of-one); `Hashed`
/// is a deterministic token-bucket embedding used when no provider key is
/// available and in tests, so retrieval stays functional offline.
pub enum EmbeddingProvider {
    OpenAi {
        client: Client<OpenAIConfig>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimensions: usize,
    },
}

impl EmbeddingProvider {
    pub fn from_env(settings: &EmbeddingSettings) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            debug!(
                dimensions = settings.embedding_dim,
                "OPENAI_API_KEY absent; using hashed embedding backend"
            );
            return Self::new_hashed(settings.embedding_dim);
        }

        let client = Client::with_config(OpenAIConfig::new().with_api_key(api_key));
        Self::OpenAi {
            client,
            model: settings.embedding_model.clone(),
            dimensions: u32::try_from(settings.embedding_dim).unwrap_or(1536),
        }
    }

    pub fn new_hashed(dimensions: usize) -> Self {
        Self::Hashed {
            dimensions: dimensions.max(8),
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::OpenAi { dimensions, .. } => *dimensions as usize,
            Self::Hashed { dimensions } => *dimensions,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Hashed { .. } => "hashed",
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        match self {
            Self::OpenAi {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .dimensions(*dimensions)
                    .input([input])
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embedding = response
                    .data
                    .first()
                    .ok_or_else(|| {
                        AppError::InternalError("No embedding data received".to_string())
                    })?
                    .embedding
                    .clone();

                Ok(embedding)
            }
            Self::Hashed { dimensions } => Ok(hashed_embedding(input, *dimensions)),
        }
    }
}

/// FNV-1a over lowercased alphanumeric tokens, folded into buckets and
/// L2-normalized. Deterministic across processes.
fn hashed_embedding(input: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];

    for token in input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let bucket = (hash % dimensions as u64) as usize;
        if let Some(slot) = vector.get_mut(bucket) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}
