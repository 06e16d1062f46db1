use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use subject_key_material::{
    Aes256GcmGenerator, AggregateStore, InMemoryAggregateStore, InMemoryCommitLog,
    KeyMaterialService, KeyStoreConfig, PostgresAggregateStore,
};
use tracing_subscriber::EnvFilter;

fn b64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    if encoded.len() > 16 {
        format!("{}...{}", &encoded[..8], &encoded[encoded.len() - 4..])
    } else {
        encoded
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = KeyStoreConfig::load(Some(Path::new("keystore.toml")))?;

    let store: Arc<dyn AggregateStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresAggregateStore::connect(&url).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory aggregate store");
            Arc::new(InMemoryAggregateStore::new())
        }
    };
    let log = Arc::new(InMemoryCommitLog::new(config.partitions));
    let generator = Arc::new(Aes256GcmGenerator);
    let service = KeyMaterialService::start(config, log, store, generator).await?;

    println!("=== Subject Key Material ===\n");

    let material = service.get_or_create("user-42").await?;
    println!("[CREATE] Subject: {}", material.subject);
    println!("[CREATE] Material ID: {}", material.id);
    println!("[CREATE] Algorithm: {} v{}", material.algorithm, material.version);
    println!("[CREATE] Key (32B): {}\n", b64(material.key.as_bytes()));

    let again = service.get_or_create("user-42").await?;
    println!("[LOOKUP] Same material: {}\n", again == material);

    let sealed = service.encrypt_for("user-42", b"jane.doe@example.com").await?;
    println!("[ENCRYPT] Ciphertext: {}", b64(sealed.as_bytes()));
    let opened = service.decrypt_for("user-42", &sealed)?;
    println!("[DECRYPT] Plaintext: {}\n", String::from_utf8_lossy(&opened));

    println!("[FORGET] Outcome: {:?}", service.forget("user-42")?);
    println!("[VIEW] Subjects: {}", service.view_len());

    service.shutdown().await;
    Ok(())
}
