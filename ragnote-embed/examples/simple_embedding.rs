//! Embed a few note blocks and print their pairwise similarity.
//!
//! Pass `mock` as the first argument to run without downloading a model.

use ragnote_embed::{EmbedConfig, EmbedModel, create_provider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let model: EmbedModel = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string())
        .parse()?;

    let temp_dir = tempfile::tempdir()?;
    let config = EmbedConfig::new(model)
        .with_cache_dir(temp_dir.path())
        .with_batch_size(2);

    println!("Model: {}  batch size: {}", config.model_name(), config.batch_size);

    let provider = create_provider(config).await?;
    println!(
        "Provider {} ready, dimension {}",
        provider.provider_name(),
        provider.embedding_dimension()
    );

    let blocks = vec![
        "Weekly sync: discussed the roadmap for Q3".to_string(),
        "Roadmap items for the third quarter".to_string(),
        "Buy oat milk and coffee beans".to_string(),
    ];
    let result = provider.embed_texts(&blocks).await?;

    for (i, a) in result.embeddings.iter().enumerate() {
        for (j, b) in result.embeddings.iter().enumerate().skip(i + 1) {
            let score: f32 = a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum();
            println!("{:>2} ~ {:<2} {score:.3}  \"{}\" / \"{}\"", i, j, blocks[i], blocks[j]);
        }
    }

    Ok(())
}
