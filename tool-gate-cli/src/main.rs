// tool-gate-cli/src/main.rs
// ============================================================================
// Module: Tool Gate CLI
// Description: Serve the gateway and operate on policy bundles from the shell.
// Purpose: One binary for serving, signing, verifying, simulating, and tokens.
// Dependencies: clap, tokio, tool-gate-core, tool-gate-mcp
// ============================================================================

//! ## Overview
//! `tool-gate serve` runs the configured transport; the `policy` subcommands
//! cover the offline bundle workflow (keygen, sign, verify, simulate, diff)
//! so operators can stage a rollout before touching the admin API; `token`
//! mints development bearer tokens for the HS256 identity mode. Logs go to
//! stderr so the stdio transport keeps stdout clean.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;

use tool_gate_config::ToolGateConfig;
use tool_gate_core::Clock;
use tool_gate_core::CompiledBundle;
use tool_gate_core::SignatureFile;
use tool_gate_core::SubjectId;
use tool_gate_core::SystemClock;
use tool_gate_core::TenantId;
use tool_gate_core::ToolCall;
use tool_gate_core::evaluate;
use tool_gate_core::policy::compare;
use tool_gate_core::policy::sign_bundle;
use tool_gate_core::policy::verify_bundle;
use tool_gate_mcp::McpGateway;
use tool_gate_mcp::Role;
use tool_gate_mcp::mint_dev_token;

// ============================================================================
// SECTION: CLI Grammar
// ============================================================================

/// Policy-driven tool-call gateway.
#[derive(Debug, Parser)]
#[command(name = "tool-gate", version, about)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway on the configured transport.
    Serve(ServeArgs),
    /// Offline policy bundle operations.
    #[command(subcommand)]
    Policy(PolicyCommand),
    /// Mint a development bearer token (HS256 identity mode).
    Token(TokenArgs),
}

/// Arguments for `serve`.
#[derive(Debug, Args)]
struct ServeArgs {
    /// Config file path; defaults to `tool-gate.toml` or `TOOL_GATE_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Policy subcommands.
#[derive(Debug, Subcommand)]
enum PolicyCommand {
    /// Generate an Ed25519 signing keypair.
    Keygen(KeygenArgs),
    /// Sign a bundle, writing the companion `.sig` document.
    Sign(SignArgs),
    /// Verify a bundle against its `.sig` document and a public key.
    Verify(VerifyArgs),
    /// Evaluate a tool call against a bundle and print the trace.
    Simulate(SimulateArgs),
    /// Structurally diff two bundles.
    Diff(DiffArgs),
}

/// Arguments for `policy keygen`.
#[derive(Debug, Args)]
struct KeygenArgs {
    /// File receiving the base64 private key.
    #[arg(long)]
    out: PathBuf,
}

/// Arguments for `policy sign`.
#[derive(Debug, Args)]
struct SignArgs {
    /// Bundle YAML to sign.
    #[arg(long)]
    bundle: PathBuf,
    /// Base64 private key file from `policy keygen`.
    #[arg(long)]
    key: PathBuf,
    /// Output `.sig` path; defaults to `<bundle>.sig`.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Arguments for `policy verify`.
#[derive(Debug, Args)]
struct VerifyArgs {
    /// Bundle YAML to verify.
    #[arg(long)]
    bundle: PathBuf,
    /// Companion `.sig` document.
    #[arg(long)]
    sig: PathBuf,
    /// Base64 Ed25519 public key.
    #[arg(long)]
    pubkey_b64: String,
}

/// Arguments for `policy simulate`.
#[derive(Debug, Args)]
struct SimulateArgs {
    /// Bundle YAML to evaluate against.
    #[arg(long)]
    bundle: PathBuf,
    /// Tool name.
    #[arg(long)]
    tool: String,
    /// JSON arguments document.
    #[arg(long, default_value = "{}")]
    arguments: String,
    /// Tenant used for the simulated call.
    #[arg(long, default_value = "default")]
    tenant: String,
}

/// Arguments for `policy diff`.
#[derive(Debug, Args)]
struct DiffArgs {
    /// Current bundle YAML.
    #[arg(long)]
    current: PathBuf,
    /// Proposed bundle YAML.
    #[arg(long)]
    proposed: PathBuf,
}

/// Arguments for `token`.
#[derive(Debug, Args)]
struct TokenArgs {
    /// Config file providing the dev secret.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Tenant claim.
    #[arg(long, default_value = "default")]
    tenant: String,
    /// Subject claim.
    #[arg(long, default_value = "dev-user")]
    subject: String,
    /// Comma-separated roles (admin, approver, viewer).
    #[arg(long, default_value = "")]
    roles: String,
    /// Token lifetime in seconds.
    #[arg(long, default_value_t = 3_600)]
    ttl_seconds: i64,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI failures printed to stderr.
#[derive(Debug, Error)]
enum CliError {
    /// File read/write failure.
    #[error("io error: {0}")]
    Io(String),
    /// Input failed to parse or verify.
    #[error("{0}")]
    Invalid(String),
    /// Gateway failed to start or serve.
    #[error("{0}")]
    Serve(String),
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tool-gate: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatches the parsed command.
async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Policy(command) => policy(command),
        Command::Token(args) => token(args),
    }
}

/// Runs the gateway until the transport exits.
async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = ToolGateConfig::load(args.config.as_deref())
        .map_err(|err| CliError::Serve(err.to_string()))?;
    let gateway =
        McpGateway::from_config(config).map_err(|err| CliError::Serve(err.to_string()))?;
    tool_gate_mcp::serve(gateway).await.map_err(|err| CliError::Serve(err.to_string()))
}

/// Handles the policy subcommands.
fn policy(command: PolicyCommand) -> Result<(), CliError> {
    match command {
        PolicyCommand::Keygen(args) => {
            let key = SigningKey::generate(&mut OsRng);
            let encoded = BASE64.encode(key.to_bytes());
            fs::write(&args.out, &encoded).map_err(|err| CliError::Io(err.to_string()))?;
            println!("public_key_b64: {}", BASE64.encode(key.verifying_key().as_bytes()));
            Ok(())
        }
        PolicyCommand::Sign(args) => {
            let bundle = fs::read(&args.bundle).map_err(|err| CliError::Io(err.to_string()))?;
            let key = read_signing_key(&args.key)?;
            let created = SystemClock.now().to_string();
            let signature = sign_bundle(&bundle, &key, &created);
            let out = args
                .out
                .unwrap_or_else(|| args.bundle.with_extension("yaml.sig"));
            let json =
                signature.to_json().map_err(|err| CliError::Invalid(err.to_string()))?;
            fs::write(&out, json).map_err(|err| CliError::Io(err.to_string()))?;
            println!("signed: {} -> {}", args.bundle.display(), out.display());
            Ok(())
        }
        PolicyCommand::Verify(args) => {
            let bundle = fs::read(&args.bundle).map_err(|err| CliError::Io(err.to_string()))?;
            let raw = fs::read(&args.sig).map_err(|err| CliError::Io(err.to_string()))?;
            let signature =
                SignatureFile::parse(&raw).map_err(|err| CliError::Invalid(err.to_string()))?;
            verify_bundle(&bundle, &signature, &args.pubkey_b64)
                .map_err(|err| CliError::Invalid(err.to_string()))?;
            println!("signature OK ({})", signature.pubkey_fingerprint);
            Ok(())
        }
        PolicyCommand::Simulate(args) => {
            let bundle = fs::read(&args.bundle).map_err(|err| CliError::Io(err.to_string()))?;
            let compiled = CompiledBundle::compile(&bundle, None)
                .map_err(|err| CliError::Invalid(err.to_string()))?;
            let arguments: serde_json::Value = serde_json::from_str(&args.arguments)
                .map_err(|err| CliError::Invalid(format!("arguments: {err}")))?;
            let call =
                ToolCall::new(args.tenant, "simulator", args.tool, arguments, "simulate");
            let decision = evaluate(&call, &compiled);
            let rendered = serde_json::to_string_pretty(&decision)
                .map_err(|err| CliError::Invalid(err.to_string()))?;
            println!("{rendered}");
            Ok(())
        }
        PolicyCommand::Diff(args) => {
            let current =
                fs::read_to_string(&args.current).map_err(|err| CliError::Io(err.to_string()))?;
            let proposed =
                fs::read_to_string(&args.proposed).map_err(|err| CliError::Io(err.to_string()))?;
            let diff =
                compare(&current, &proposed).map_err(|err| CliError::Invalid(err.to_string()))?;
            let rendered = serde_json::to_string_pretty(&diff)
                .map_err(|err| CliError::Invalid(err.to_string()))?;
            println!("{rendered}");
            Ok(())
        }
    }
}

/// Mints a development bearer token.
fn token(args: TokenArgs) -> Result<(), CliError> {
    let config = ToolGateConfig::load(args.config.as_deref())
        .map_err(|err| CliError::Invalid(err.to_string()))?;
    let mut roles = BTreeSet::new();
    for label in args.roles.split(',').map(str::trim).filter(|label| !label.is_empty()) {
        let role = Role::parse(label)
            .ok_or_else(|| CliError::Invalid(format!("unknown role '{label}'")))?;
        roles.insert(role);
    }
    let expires = SystemClock.now().as_secs() + args.ttl_seconds;
    let token = mint_dev_token(
        &config.identity,
        &TenantId::new(args.tenant),
        &SubjectId::new(args.subject),
        &roles,
        expires,
    )
    .map_err(|err| CliError::Invalid(err.to_string()))?;
    println!("{token}");
    Ok(())
}

/// Reads a base64 private key file from `policy keygen`.
fn read_signing_key(path: &PathBuf) -> Result<SigningKey, CliError> {
    let encoded = fs::read_to_string(path).map_err(|err| CliError::Io(err.to_string()))?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| CliError::Invalid(format!("key file: {err}")))?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CliError::Invalid("key file must hold 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
