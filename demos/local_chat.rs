//! Local chat example demonstrating basic messenger functionality.
//!
//! This example shows how to:
//! - Run a signaling relay in-process
//! - Bootstrap a chat between two identities
//! - Send messages and a file over the ratchet session

use ratchet_messenger::{
    ContentType, Keyring, MemoryHub, MemoryTransportFactory, Messenger, MessengerConfig,
    PeerEvent, Relay, UserProfile,
};
use std::sync::Arc;

fn start(name: &str, relay: &Arc<Relay>, hub: &Arc<MemoryHub>, config: &MessengerConfig) -> Messenger {
    let keyring = Keyring::new(UserProfile::new(name.to_string()));
    let (signaling, signals) = relay.register(&keyring.profile().identity.id);
    Messenger::start(
        config.clone(),
        keyring,
        signaling,
        signals,
        Arc::new(MemoryTransportFactory::new(Arc::clone(hub))),
    )
}

async fn until<F: Fn(&PeerEvent) -> bool>(messenger: &mut Messenger, matches: F) -> Option<PeerEvent> {
    while let Some(event) = messenger.next_event().await {
        if matches(&event) {
            return Some(event);
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("🔐 Ratchet Messenger - Local Chat Example");
    println!("=========================================");

    let data_dir = std::env::current_dir()?.join("example-data");
    let mut config = MessengerConfig::default();
    config.storage.media_dir = data_dir.join("media");
    config.storage.keys_dir = data_dir.join("keys");
    config.storage.data_dir = data_dir;
    config.ensure_directories()?;

    let relay = Relay::new();
    let hub = MemoryHub::new();
    let mut alice = start("Alice", &relay, &hub, &config);
    let mut bob = start("Bob", &relay, &hub, &config);
    println!("👤 Alice: {}", alice.local_id());
    println!("👤 Bob:   {}", bob.local_id());

    // Alice asks Bob for a chat; Bob accepts and Alice connects.
    alice.request_chat(bob.public_key()).await?;
    until(&mut bob, |e| matches!(e, PeerEvent::ChatRequest { .. })).await;
    until(&mut alice, |e| matches!(e, PeerEvent::Connected { .. })).await;
    until(&mut bob, |e| matches!(e, PeerEvent::Connected { .. })).await;
    println!("✅ Chat established");

    let bob_id = bob.local_id().to_string();
    for text in ["Hello Bob!", "Every message gets a fresh key."] {
        alice.send_text(&bob_id, text)?;
        if let Some(PeerEvent::Message { message, .. }) =
            until(&mut bob, |e| matches!(e, PeerEvent::Message { .. })).await
        {
            println!("📨 Bob received: {}", message.content);
        }
    }

    let attachment = config.storage.data_dir.join("hello.txt");
    std::fs::write(&attachment, "A file streamed over a data channel.\n")?;
    alice.send_file(&bob_id, &attachment, ContentType::File).await?;
    if let Some(PeerEvent::Message {
        file: Some(path), ..
    }) = until(&mut bob, |e| matches!(e, PeerEvent::Message { .. })).await
    {
        println!("📁 Bob saved {}", path.display());
    }

    alice.disconnect(&bob_id)?;
    println!("👋 Example completed");
    Ok(())
}
