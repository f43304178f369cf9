//! Public/secret CURVE keypair generator (§6).
//!
//! Grounded in `examples/original_source/src/modules/keypair/keypair.cpp`:
//! generate one keypair, write the public half unconditionally and the
//! secret half only if the destination does not already exist.

use std::path::PathBuf;

use clap::Parser;
use umps::keys::{write_public_key_file, write_secret_key_file, KeyPair};

/// Generate a public/private CURVE keypair for use with a stonehouse-tier
/// socket.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Destination for the public key file.
    #[arg(long, default_value = "publicKey.key")]
    publickey: PathBuf,

    /// Destination for the private key file. Refused if it already exists.
    #[arg(long, default_value = "privateKey.key")]
    privatekey: PathBuf,
}

fn main() -> umps::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let pair = KeyPair::generate()?;
    write_public_key_file(&args.publickey, &pair.public, None)?;
    write_secret_key_file(&args.privatekey, &pair.secret, None)?;

    println!("Wrote public key to {}", args.publickey.display());
    println!("Wrote private key to {}", args.privatekey.display());
    Ok(())
}
