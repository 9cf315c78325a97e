//! keygen: print a nostr key pair in hex and bech32 forms.

use anyhow::{Context, Result};
use clap::Parser;

use pingpong_core::Identity;

#[derive(Parser, Debug)]
#[command(name = "keygen")]
#[command(about = "Generate a nostr key pair, or show the encodings of an existing one")]
struct Args {
    /// Existing secret key (hex or nsec); a fresh one is generated if omitted
    #[arg(long)]
    secret: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let identity = match args.secret.as_deref() {
        Some(secret) => Identity::from_secret(secret).context("Invalid secret key")?,
        None => Identity::generate(),
    };

    println!("secret: {}", identity.secret_hex());
    println!("nsec:   {}", identity.nsec().context("Failed to encode nsec")?);
    println!("public: {}", identity.public_key());
    println!("npub:   {}", identity.npub().context("Failed to encode npub")?);
    Ok(())
}
