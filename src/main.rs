use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use transit_engine::{
    ConfigUpdate, DataKeyRequest, EncryptRequest, InMemoryStorage, PolicyOptions, PolicyStore,
    StoreConfig,
};

fn short(envelope: &str) -> String {
    if envelope.len() > 24 {
        format!("{}...{}", &envelope[..16], &envelope[envelope.len() - 4..])
    } else {
        envelope.to_string()
    }
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = StoreConfig::from_env().expect("Invalid configuration");
    println!("=== Transit Engine ===\n");
    println!(
        "[CONFIG] cache: {}, resident versions: {}\n",
        if config.cache_enabled { "on" } else { "off" },
        config.resident_versions
    );

    let storage = Arc::new(InMemoryStorage::new());
    let store = PolicyStore::new(storage, config).expect("Failed to create policy store");

    let info = store
        .create_or_update_policy("test", &PolicyOptions::default())
        .expect("Failed to create policy");
    println!("[CREATE] Policy '{}' ({}) v{}", info.name, info.key_type, info.latest_version);

    let plaintext = b"the quick brown fox";
    let c0 = store
        .encrypt("test", &EncryptRequest::new(&plaintext[..]))
        .expect("Encryption failed");
    println!("[ENCRYPT] C0: {}", short(&c0));

    let decrypted = store.decrypt("test", &c0, None).expect("Decryption failed");
    println!("[DECRYPT] C0: {}\n", String::from_utf8_lossy(&decrypted));

    println!("=== Rotation ===\n");
    let latest = store.rotate("test").expect("Rotation failed");
    println!("[ROTATE] latest version: v{}", latest);

    let c1 = store
        .encrypt("test", &EncryptRequest::new(&plaintext[..]))
        .expect("Encryption failed");
    println!("[ENCRYPT] C1: {}", short(&c1));

    let still = store.decrypt("test", &c0, None).expect("Decryption of C0 failed");
    println!("[DECRYPT] C0 after rotation: {}\n", String::from_utf8_lossy(&still));

    println!("=== Minimum Decryption Version ===\n");
    store
        .update_config(
            "test",
            &ConfigUpdate {
                min_decryption_version: Some(2),
                ..Default::default()
            },
        )
        .expect("Config update failed");
    match store.decrypt("test", &c0, None) {
        Ok(_) => println!("[DECRYPT] C0 unexpectedly decrypted"),
        Err(e) => println!("[DECRYPT] C0 rejected: {}", e),
    }
    let decrypted = store.decrypt("test", &c1, None).expect("Decryption of C1 failed");
    println!("[DECRYPT] C1: {}\n", String::from_utf8_lossy(&decrypted));

    println!("=== Derived Keys ===\n");
    let derived = PolicyOptions {
        derived: true,
        ..Default::default()
    };
    store
        .create_or_update_policy("tenants", &derived)
        .expect("Failed to create derived policy");
    let tenant_a = store
        .encrypt("tenants", &EncryptRequest::new(&plaintext[..]).with_context("tenant-a"))
        .expect("Derived encryption failed");
    println!("[ENCRYPT] tenant-a: {}", short(&tenant_a));
    match store.decrypt("tenants", &tenant_a, Some(b"tenant-b")) {
        Ok(_) => println!("[DECRYPT] tenant-b unexpectedly decrypted tenant-a data"),
        Err(e) => println!("[DECRYPT] tenant-b context rejected: {}", e),
    }
    println!();

    println!("=== Data Keys ===\n");
    let data_key = store
        .generate_data_key("test", &DataKeyRequest::default())
        .expect("Data key generation failed");
    println!("[DATAKEY] wrapped: {}", short(&data_key.ciphertext));
    println!(
        "[DATAKEY] plaintext: {} bytes\n",
        data_key.plaintext.as_ref().map(|k| k.len()).unwrap_or(0)
    );

    println!("=== Policies ===\n");
    for name in store.list_policies().expect("Listing failed") {
        let info = store.read_policy(&name).expect("Read failed");
        println!(
            "[POLICY] {}: latest v{}, min decryption v{}, derived: {}, versions: {:?}",
            info.name,
            info.latest_version,
            info.min_decryption_version,
            info.derived,
            info.versions.keys().collect::<Vec<_>>()
        );
    }
}
