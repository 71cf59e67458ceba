//! Strive Auth CLI
//!
//! Helpers for inspecting tickets and envelopes, plus authenticated calls
//! with a saved session credential.
//!
//! ```text
//! strive-auth ticket    <token-hex> <ip> <elapsed-secs>
//! strive-auth encrypt   <json>
//! strive-auth decrypt   <response-hex>
//! strive-auth open      <request-base64url>
//! strive-auth public-ip
//! strive-auth call      <credential.json> <player-id> <endpoint> <json-body>
//! ```
//!
//! `credential.json` holds `{"steam_id": .., "session_token": ".."}`.

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use strive_auth::{
    core::envelope::{self, StructuredValue},
    network::{HttpIpResolver, PublicIpResolver},
    ApiClient, AuthTicket, ClientConfig, SessionCredential, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = ClientConfig::from_env()?;
    info!("Strive Auth v{}", VERSION);

    match args.first().map(String::as_str) {
        Some("ticket") => {
            let [token, ip, elapsed] = rest::<3>(&args)?;
            let token = hex::decode(token).context("token must be hex")?;
            let elapsed: f64 = elapsed.parse().context("elapsed must be a number")?;
            let ticket = AuthTicket::build_from_str(&token, elapsed, ip)?;

            println!("{}", hex::encode_upper(ticket.encode()));
            println!("crc32 {:08x}", ticket.crc32());
        }
        Some("encrypt") => {
            let [json] = rest::<1>(&args)?;
            let json: serde_json::Value = serde_json::from_str(json).context("invalid JSON")?;
            let message: StructuredValue =
                rmpv::ext::to_value(json).context("JSON not representable as MessagePack")?;
            println!("{}", envelope::encrypt(&message, &config.key)?);
        }
        Some("decrypt") => {
            let [hex_body] = rest::<1>(&args)?;
            let value = envelope::decrypt(hex_body.trim(), &config.key)?;
            print_value(value)?;
        }
        Some("open") => {
            let [payload] = rest::<1>(&args)?;
            let value = envelope::open_request(payload, &config.key)?;
            print_value(value)?;
        }
        Some("public-ip") => {
            let ip = HttpIpResolver::from_config(&config).public_ip().await?;
            println!("{}", ip);
        }
        Some("call") => {
            let [credential_path, player_id, endpoint, body] = rest::<4>(&args)?;
            let raw = std::fs::read_to_string(credential_path)
                .with_context(|| format!("failed to read {}", credential_path))?;
            let credential: SessionCredential =
                serde_json::from_str(&raw).context("invalid credential file")?;

            let body: serde_json::Value = serde_json::from_str(body).context("invalid JSON body")?;
            let body: StructuredValue =
                rmpv::ext::to_value(body).context("JSON not representable as MessagePack")?;

            let api = ApiClient::connect(&config, credential, player_id)?;
            let response = api.call(endpoint, body).await?;
            print_value(response.body)?;
        }
        Some(other) => bail!("unrecognized command: {}", other),
        None => bail!("usage: strive-auth <ticket|encrypt|decrypt|open|public-ip|call> ..."),
    }

    Ok(())
}

/// The `N` arguments after the subcommand.
fn rest<const N: usize>(args: &[String]) -> Result<[&str; N]> {
    let given: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    given
        .try_into()
        .map_err(|v: Vec<&str>| anyhow::anyhow!("expected {} arguments, got {}", N, v.len()))
}

fn print_value(value: StructuredValue) -> Result<()> {
    let json: serde_json::Value = rmpv::ext::from_value(value).context("value has no JSON form")?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
