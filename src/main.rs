use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use course_escrow::{
    config::EscrowConfig,
    content::{ContentRef, ContentStore, FsContentStore},
    journal::{parse_signing_key, parse_verifying_key, replay, verify_chain, Journal},
    payout::OutboxPayout,
    CourseId, CourseTerms, Ledger, Operation, Outcome, Timestamp,
};

//==================== CLI ====================//

#[derive(Parser)]
#[command(name = "escrow", version)]
#[command(about = "Course escrow ledger: paid enrollment, completion refunds, educator payouts")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and ESCROW_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Current time as Unix seconds (defaults to the system clock)
    #[arg(long, global = true)]
    now: Option<Timestamp>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 identity (sk.hex / pk.hex)
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Store a file in the content store and print its identifier
    Pin { file: PathBuf },

    /// Verify the journal chain, replay it and check conservation of funds
    Audit {
        /// Require every entry to be signed by this public key (hex)
        #[arg(long)]
        trusted_key: Option<String>,
    },

    #[command(flatten)]
    Ledger(LedgerCommand),
}

/// Commands that run against the ledger rebuilt from the journal.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Course listings
    #[command(subcommand)]
    Course(CourseCommand),

    /// Pay for and enroll in a course
    Enroll {
        #[arg(long = "as", value_name = "IDENTITY")]
        caller: String,
        course_id: CourseId,
        #[arg(long)]
        payment: u64,
    },

    /// Mark a learner's enrollment complete (course owner only)
    Complete {
        #[arg(long = "as", value_name = "IDENTITY")]
        caller: String,
        learner: String,
        course_id: CourseId,
    },

    /// Withdraw the caller's accumulated earnings
    Withdraw {
        #[arg(long = "as", value_name = "IDENTITY")]
        caller: String,
    },

    /// Show an educator's balance
    Balance { educator: String },

    /// List the course ids a learner is enrolled in
    Enrollments { learner: String },

    /// Show one enrollment
    Enrollment { learner: String, course_id: CourseId },

    /// Print the full ledger snapshot
    State,
}

#[derive(Subcommand)]
enum CourseCommand {
    Create {
        #[arg(long = "as", value_name = "IDENTITY")]
        caller: String,
        #[command(flatten)]
        terms: TermsArgs,
    },
    Update {
        #[arg(long = "as", value_name = "IDENTITY")]
        caller: String,
        course_id: CourseId,
        #[command(flatten)]
        terms: TermsArgs,
        /// Stop accepting enrollments
        #[arg(long)]
        inactive: bool,
    },
    Show {
        course_id: CourseId,
    },
    List {
        #[arg(long)]
        educator: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Args)]
struct TermsArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    /// File to pin; its identifier becomes the content reference
    #[arg(long, conflicts_with = "content_ref", required_unless_present = "content_ref")]
    content: Option<PathBuf>,
    /// Identifier of already pinned content
    #[arg(long)]
    content_ref: Option<String>,
    /// Price in the smallest currency unit
    #[arg(long)]
    price: u64,
    /// Seconds from enrollment to the refund deadline
    #[arg(long)]
    time_limit: u64,
    /// Share of the price refunded on time, 0..=100
    #[arg(long)]
    refund_percentage: u8,
}

//==================== application context ====================//

struct App {
    config: EscrowConfig,
    journal: Journal,
    ledger: Ledger,
    now: Timestamp,
}

impl App {
    fn open(config: EscrowConfig, now: Timestamp) -> Result<Self> {
        let signer = config
            .operator_key_hex
            .as_deref()
            .map(parse_signing_key)
            .transpose()
            .context("operator key")?;
        let (journal, ledger) = Journal::load(config.journal_path(), signer)
            .with_context(|| format!("load journal {}", config.journal_path().display()))?;
        Ok(Self {
            config,
            journal,
            ledger,
            now,
        })
    }

    /// Execute against the ledger, then journal what committed. Transfers go
    /// to the outbox.
    fn submit(&mut self, operation: Operation) -> Result<Outcome> {
        let mut payout = OutboxPayout::new(self.config.outbox_path());
        let outcome = self
            .ledger
            .execute(&operation, self.now, &mut payout)
            .with_context(|| format!("{} rejected", operation.name()))?;
        for entry in self.journal.record(&mut self.ledger)? {
            info!(
                sequence = entry.sequence,
                op = entry.operation.name(),
                caller = entry.operation.caller(),
                "committed"
            );
        }
        Ok(outcome)
    }

    fn content_store(&self) -> Result<FsContentStore> {
        Ok(FsContentStore::open(self.config.content_path())?)
    }

    fn course_terms(&self, args: TermsArgs) -> Result<CourseTerms> {
        let content_ref = match (args.content, args.content_ref) {
            (Some(path), _) => {
                let bytes = read_file(&path)?;
                self.content_store()?.put_blob(&bytes)?
            }
            (None, Some(raw)) => ContentRef::parse(&raw)?,
            (None, None) => bail!("either --content or --content-ref is required"),
        };
        Ok(CourseTerms {
            title: args.title,
            description: args.description,
            content_ref: content_ref.to_string(),
            price: args.price,
            completion_time_limit: args.time_limit,
            refund_percentage: args.refund_percentage,
        })
    }
}

//==================== helpers ====================//

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).with_context(|| format!("log filter {filter:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

//==================== commands ====================//

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;

    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();

    write_file(&out_dir.join("sk.hex"), hex::encode(sk_bytes).as_bytes())?;
    write_file(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes())?;
    println!("identity {}", hex::encode(pk.as_bytes()));
    println!("keypair written → {}", out_dir.display());
    Ok(())
}

fn course_cmd(app: &mut App, command: CourseCommand) -> Result<()> {
    match command {
        CourseCommand::Create { caller, terms } => {
            let terms = app.course_terms(terms)?;
            match app.submit(Operation::CreateCourse { caller, terms })? {
                Outcome::CourseCreated(id) => println!("course {id} created"),
                other => bail!("unexpected outcome {other:?}"),
            }
        }
        CourseCommand::Update {
            caller,
            course_id,
            terms,
            inactive,
        } => {
            let terms = app.course_terms(terms)?;
            app.submit(Operation::UpdateCourse {
                caller,
                course_id,
                terms,
                is_active: !inactive,
            })?;
            println!("course {course_id} updated");
        }
        CourseCommand::Show { course_id } => print_json(app.ledger.course(course_id)?)?,
        CourseCommand::List {
            educator,
            offset,
            limit,
        } => match educator {
            Some(educator) => print_json(&app.ledger.courses_by_educator(&educator))?,
            None => print_json(&app.ledger.courses(offset, limit))?,
        },
    }
    Ok(())
}

#[derive(Serialize)]
struct AuditReport {
    entries: usize,
    height: u64,
    state_root: String,
    conserved: bool,
    payments_received: u64,
    refunds_paid: u64,
    withdrawals_paid: u64,
    outbox_total: u128,
}

fn audit_cmd(config: &EscrowConfig, trusted_key: Option<String>) -> Result<()> {
    let trusted = match trusted_key {
        Some(hex) => Some(parse_verifying_key(&hex)?),
        None => config
            .operator_key_hex
            .as_deref()
            .map(|sk| parse_signing_key(sk).map(|k| k.verifying_key()))
            .transpose()?,
    };
    let entries = course_escrow::journal::read_entries(&config.journal_path())?;
    verify_chain(&entries, trusted.as_ref()).context("journal chain")?;
    let ledger = replay(&entries)?;
    let totals = ledger.totals();
    let outbox_total: u128 = OutboxPayout::read_all(&config.outbox_path())?
        .iter()
        .map(|t| t.amount as u128)
        .sum();
    let paid_out = totals.refunds_paid as u128 + totals.withdrawals_paid as u128;
    if outbox_total != paid_out {
        warn!(%outbox_total, %paid_out, "outbox does not match journaled payouts");
    }
    let report = AuditReport {
        entries: entries.len(),
        height: ledger.height(),
        state_root: hex::encode(ledger.state_root()),
        conserved: ledger.is_conserved(),
        payments_received: totals.payments_received,
        refunds_paid: totals.refunds_paid,
        withdrawals_paid: totals.withdrawals_paid,
        outbox_total,
    };
    print_json(&report)?;
    if !report.conserved {
        bail!("conservation of funds violated");
    }
    Ok(())
}

fn ledger_cmd(app: &mut App, command: LedgerCommand) -> Result<()> {
    match command {
        LedgerCommand::Course(course) => course_cmd(app, course)?,
        LedgerCommand::Enroll {
            caller,
            course_id,
            payment,
        } => {
            app.submit(Operation::EnrollInCourse {
                caller,
                course_id,
                payment,
            })?;
            println!("enrolled in course {course_id}");
        }
        LedgerCommand::Complete {
            caller,
            learner,
            course_id,
        } => {
            app.submit(Operation::MarkCourseCompleted {
                caller,
                learner: learner.clone(),
                course_id,
            })?;
            let enrollment = app.ledger.enrollment(&learner, course_id)?;
            if enrollment.is_refunded {
                println!(
                    "course {course_id} completed on time, refund {}",
                    enrollment.refund_amount()
                );
            } else {
                println!("course {course_id} completed after the deadline, no refund");
            }
        }
        LedgerCommand::Withdraw { caller } => {
            match app.submit(Operation::WithdrawBalance { caller })? {
                Outcome::Withdrawn(amount) => println!("withdrawn {amount}"),
                other => bail!("unexpected outcome {other:?}"),
            }
        }
        LedgerCommand::Balance { educator } => println!("{}", app.ledger.balance_of(&educator)),
        LedgerCommand::Enrollments { learner } => {
            print_json(&app.ledger.learner_enrollments(&learner))?
        }
        LedgerCommand::Enrollment { learner, course_id } => {
            print_json(app.ledger.enrollment(&learner, course_id)?)?
        }
        LedgerCommand::State => print_json(&app.ledger.snapshot())?,
    }
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EscrowConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    init_tracing(&config.log_filter)?;
    let now = cli.now.unwrap_or_else(unix_now);

    match cli.command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Audit { trusted_key } => audit_cmd(&config, trusted_key),
        Command::Pin { file } => {
            let bytes = read_file(&file)?;
            let mut store = FsContentStore::open(config.content_path())?;
            println!("{}", store.put_blob(&bytes)?);
            Ok(())
        }
        Command::Ledger(command) => {
            let mut app = App::open(config, now)?;
            ledger_cmd(&mut app, command)
        }
    }
}
