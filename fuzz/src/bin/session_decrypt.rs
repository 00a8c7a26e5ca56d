#[macro_use]
extern crate afl;
use hushwire::fanout::MemoryTransport;
use hushwire::{
    Config, Destination, Envelope, InMemoryDirectory, MemoryKeyValueStore, Messenger, Payload,
    SessionCiphertext,
};
use std::sync::Arc;

type Device = Messenger<MemoryKeyValueStore, InMemoryDirectory, MemoryTransport>;

async fn open(name: &str, directory: &Arc<InMemoryDirectory>) -> Device {
    Messenger::open(
        name,
        Arc::new(MemoryKeyValueStore::new()),
        directory.clone(),
        Arc::new(MemoryTransport::new()),
        Config::default(),
    )
    .await
    .expect("Setup failed")
}

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("Setup failed");

    // The victim holds an established session with the attacker.
    let victim = runtime.block_on(async {
        let directory = Arc::new(InMemoryDirectory::new());
        let victim = open("victim", &directory).await;
        let attacker = open("attacker", &directory).await;
        let hello = attacker
            .encrypt_direct("victim", b"hello")
            .await
            .expect("Setup failed");
        victim.decrypt_direct(&hello).await.expect("Setup failed");
        victim
    });

    fuzz!(|data: &[u8]| {
        let Ok(ciphertext) = SessionCiphertext::from_bytes(data) else {
            return;
        };
        let envelope = Envelope {
            id: "fuzz".to_string(),
            sender_id: "attacker".to_string(),
            destination: Destination::Device("victim".to_string()),
            payload: Payload::from(ciphertext),
            created_at: 0,
            delivered: false,
        };
        let _ = runtime.block_on(victim.decrypt_direct(&envelope));
    });
}
