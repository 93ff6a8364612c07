use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use attest_core::checks::patterns::citation_markers;
use attest_core::{
    fact, verify_signature, CitationEnforcer, Policy, PrivacyRedactor, RawFact,
    VerificationRequest,
};
use attest_runtime::{
    AuditStore, FileAuditStore, RuntimeConfig, SigningKey, VerificationRuntime,
    DEFAULT_SIGNING_KEY_ENV,
};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Exit status when verification completes but the narrative must not be released.
const EXIT_BLOCKED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "attest")]
#[command(about = "Verify numeric claims in generated narratives and keep an audit trail")]
#[command(version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify a request (JSON) against a policy
    Verify(VerifyArgs),

    /// Redact personal data from a text
    Redact(RedactArgs),

    /// List the numeric claims of a narrative and how they reconcile
    Scan(ScanArgs),

    /// Policy tools
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Audit store tools
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Args)]
struct PolicyArg {
    /// Policy file (YAML or JSON); defaults apply when omitted
    #[arg(short, long)]
    policy: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// Request file (JSON), `-` for stdin
    #[arg(short, long, default_value = "-")]
    request: PathBuf,

    #[command(flatten)]
    policy: PolicyArg,

    /// Runtime configuration (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Audit store directory (overrides the config)
    #[arg(long)]
    audit_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RedactArgs {
    /// Input file, `-` for stdin
    #[arg(default_value = "-")]
    input: PathBuf,

    #[command(flatten)]
    policy: PolicyArg,

    /// Caller role (repeatable)
    #[arg(long = "role")]
    roles: Vec<String>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Narrative file, `-` for stdin
    #[arg(default_value = "-")]
    input: PathBuf,

    /// Facts to reconcile against (JSON array)
    #[arg(long)]
    facts: Option<PathBuf>,

    #[command(flatten)]
    policy: PolicyArg,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    /// Validate a policy and print its digest and warnings
    Check { path: PathBuf },
}

#[derive(Debug, Args)]
struct AuditDirArg {
    /// Audit store directory
    #[arg(long)]
    dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// List stored records in append order
    List(AuditDirArg),

    /// Print one stored record
    Show {
        #[command(flatten)]
        store: AuditDirArg,
        request_id: String,
    },

    /// Verify the hash chain and, when a key is available, every signature
    Verify {
        #[command(flatten)]
        store: AuditDirArg,

        /// Environment variable holding the signing key
        #[arg(long, default_value = DEFAULT_SIGNING_KEY_ENV)]
        key_env: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Verify(args) => run_verify(args).await,
        Command::Redact(args) => run_redact(args),
        Command::Scan(args) => run_scan(args),
        Command::Policy { command } => run_policy(command),
        Command::Audit { command } => run_audit(command),
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_verify(args: VerifyArgs) -> Result<ExitCode> {
    let policy = load_policy(&args.policy)?;
    let request: VerificationRequest = serde_json::from_str(&read_input(&args.request)?)
        .with_context(|| format!("invalid request JSON in {}", args.request.display()))?;

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if args.audit_dir.is_some() {
        config.audit_dir = args.audit_dir;
    }

    let runtime =
        VerificationRuntime::from_config(config).context("failed to start verification runtime")?;
    let result = runtime
        .verify(request, Arc::new(policy))
        .await
        .context("verification failed")?;
    let outcome = result.outcome;

    if outcome.summary.ok {
        emit_json(&json!({
            "ok": true,
            "narrative": outcome.summary.redacted_narrative,
            "issues": outcome.summary.issues,
            "counts": outcome.summary.counts,
            "confidence": outcome.confidence,
            "audit": outcome.audit,
            "sequence": result.stored.map(|s| s.link.sequence),
        }))?;
        Ok(ExitCode::SUCCESS)
    } else {
        emit_json(&json!({
            "ok": false,
            "issues": outcome.summary.issues,
            "counts": outcome.summary.counts,
            "confidence": outcome.confidence,
            "audit": outcome.audit,
            "sequence": result.stored.map(|s| s.link.sequence),
        }))?;
        Ok(ExitCode::from(EXIT_BLOCKED))
    }
}

fn run_redact(args: RedactArgs) -> Result<ExitCode> {
    let policy = load_policy(&args.policy)?;
    let text = read_input(&args.input)?;

    let redactor = PrivacyRedactor::from_policy(&policy);
    let (redacted, issues) = redactor.redact(&text, &args.roles, policy.privacy.k_anonymity);

    emit_json(&json!({
        "redacted": redacted,
        "issues": issues,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_scan(args: ScanArgs) -> Result<ExitCode> {
    let policy = load_policy(&args.policy)?;
    let narrative = read_input(&args.input)?;

    let raw_facts: Vec<RawFact> = match &args.facts {
        Some(path) => serde_json::from_str(&read_input(path)?)
            .with_context(|| format!("invalid facts JSON in {}", path.display()))?,
        None => Vec::new(),
    };
    let (facts, malformed) = fact::ingest_all(raw_facts);

    let outcome = CitationEnforcer::from_policy(&policy).analyze(&narrative, &facts);
    let markers: Vec<_> = citation_markers(&narrative)
        .into_iter()
        .map(|m| json!({ "span": m.span, "source": m.source }))
        .collect();

    emit_json(&json!({
        "claims": outcome.claims,
        "citation_markers": markers,
        "issues": malformed.into_iter().chain(outcome.issues).collect::<Vec<_>>(),
        "notes": outcome.notes,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_policy(command: PolicyCommand) -> Result<ExitCode> {
    match command {
        PolicyCommand::Check { path } => {
            let policy = Policy::from_file(&path)
                .with_context(|| format!("invalid policy {}", path.display()))?;
            let digest = policy.digest().context("failed to digest policy")?;
            emit_json(&json!({
                "valid": true,
                "policy_version": policy.policy_version,
                "digest": digest,
                "crosschecks": policy.crosschecks.len(),
                "sanity_rules": policy.sanity.len(),
                "warnings": policy.diagnostics(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_audit(command: AuditCommand) -> Result<ExitCode> {
    match command {
        AuditCommand::List(args) => {
            let store = open_store(&args.dir)?;
            emit_json(&store.list().context("failed to read audit index")?)?;
            Ok(ExitCode::SUCCESS)
        }
        AuditCommand::Show { store, request_id } => {
            let store = open_store(&store.dir)?;
            let stored = store
                .get(&request_id)
                .context("failed to read audit record")?
                .ok_or_else(|| anyhow!("no audit record for request '{}'", request_id))?;
            emit_json(&stored)?;
            Ok(ExitCode::SUCCESS)
        }
        AuditCommand::Verify { store, key_env } => {
            let store = open_store(&store.dir)?;
            let entries = store.entries().context("failed to read audit records")?;
            attest_core::verify_chain(&entries).context("audit chain verification failed")?;

            let key = SigningKey::from_env(&key_env);
            let mut signed = 0usize;
            let mut unsigned = 0usize;
            for entry in &entries {
                if !entry.record.is_signed() {
                    unsigned += 1;
                    continue;
                }
                signed += 1;
                if let Some(key) = &key {
                    verify_signature(&entry.record, key.expose()).with_context(|| {
                        format!("signature check failed for '{}'", entry.record.request_id)
                    })?;
                }
            }
            if signed > 0 && key.is_none() {
                tracing::warn!(key_env = %key_env, "No signing key available, signatures not checked");
            }

            emit_json(&json!({
                "chain_valid": true,
                "records": entries.len(),
                "signed": signed,
                "unsigned": unsigned,
                "signatures_checked": key.is_some(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(dir: &Path) -> Result<FileAuditStore> {
    if !dir.is_dir() {
        bail!("audit store directory {} does not exist", dir.display());
    }
    FileAuditStore::open(dir)
        .with_context(|| format!("failed to open audit store {}", dir.display()))
}

fn load_policy(arg: &PolicyArg) -> Result<Policy> {
    match &arg.policy {
        Some(path) => Policy::from_file(path)
            .with_context(|| format!("failed to load policy {}", path.display())),
        None => Ok(Policy::default()),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        return Ok(buffer);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn emit_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
