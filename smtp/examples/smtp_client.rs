//! Submits a message to a locally running relay.
//!
//! Usage: `cargo run --example smtp_client -- <recipient> [host] [port]`

use std::env;

use lettre::{
    message::header::ContentType, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let recipient = args
        .next()
        .unwrap_or_else(|| "recipient@example.com".to_string());
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(2525);

    let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
        .port(port)
        .build();

    let email = Message::builder()
        .from("Test User <test@example.com>".parse()?)
        .to(recipient.parse()?)
        .subject("Mailveil relay test")
        .header(ContentType::TEXT_PLAIN)
        .body("If this recipient has an encryption policy, this text arrives encrypted.".to_string())?;

    transport.send(email).await?;
    println!("Submitted message for {recipient} to {host}:{port}");
    Ok(())
}
