use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use profetch_client::{CsvExporter, JsonExtractor, JsonLinesExporter, ReqwestFetcher};
use profetch_core::orchestrator::DEFAULT_MIN_QUALITY;
use profetch_core::{
    Budget, BudgetOverrides, Exporter, Operation, OrchestrationLoop, QualityAnalyzer,
    QualityReport, QualitySchema, Record, RetryingExecutor, TargetRegistry, export_all,
};

#[derive(Parser)]
#[command(name = "profetch", version, about = "Rate-limited, self-healing profile fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every target listed in a file and export the results
    Run {
        /// File with one target per line (`-` for stdin). A line may be
        /// `<key> <target>`; blank lines and `#` comments are skipped.
        #[arg(short, long)]
        input: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Jsonl)]
        format: Format,

        /// Quality schema JSON file (defaults to the built-in profile schema)
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Flag records whose overall quality score is below this value
        #[arg(long, env = "PROFETCH_MIN_QUALITY", default_value_t = DEFAULT_MIN_QUALITY)]
        min_quality: f64,

        /// JSON pointer to the profile object inside each response
        #[arg(long, env = "PROFETCH_POINTER")]
        pointer: Option<String>,

        /// User-Agent header sent with every request
        #[arg(long, env = "PROFETCH_USER_AGENT")]
        user_agent: Option<String>,

        /// Allow targets on private/loopback addresses
        #[arg(long, env = "PROFETCH_ALLOW_PRIVATE_URLS", default_value_t = false)]
        allow_private_urls: bool,

        #[command(flatten)]
        budget: BudgetArgs,
    },

    /// Score a stored record against a quality schema
    Score {
        /// JSON file holding one record object (`-` for stdin)
        #[arg(short, long)]
        record: String,

        /// Quality schema JSON file (defaults to the built-in profile schema)
        #[arg(long)]
        schema: Option<PathBuf>,

        #[arg(long, env = "PROFETCH_MIN_QUALITY", default_value_t = DEFAULT_MIN_QUALITY)]
        min_quality: f64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Jsonl,
    Csv,
}

/// Budget flags. Each one overrides the config file, which overrides the defaults.
#[derive(Args, Debug, Default)]
struct BudgetArgs {
    /// JSON file with budget overrides (durations in milliseconds)
    #[arg(long, env = "PROFETCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PROFETCH_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,
    #[arg(long, env = "PROFETCH_BASE_DELAY_MS")]
    base_delay_ms: Option<u64>,
    #[arg(long, env = "PROFETCH_MAX_DELAY_MS")]
    max_delay_ms: Option<u64>,
    #[arg(long, env = "PROFETCH_MIN_DELAY_MS")]
    min_delay_ms: Option<u64>,
    #[arg(long, env = "PROFETCH_JITTER")]
    jitter_fraction: Option<f64>,
    /// Lower bound of the human-like delay multiplier
    #[arg(long, env = "PROFETCH_HUMANIZE_MIN", requires = "humanize_max")]
    humanize_min: Option<f64>,
    /// Upper bound of the human-like delay multiplier
    #[arg(long, env = "PROFETCH_HUMANIZE_MAX", requires = "humanize_min")]
    humanize_max: Option<f64>,
    #[arg(long, env = "PROFETCH_TOKENS_PER_SECOND")]
    tokens_per_second: Option<f64>,
    #[arg(long, env = "PROFETCH_BUCKET_CAPACITY")]
    bucket_capacity: Option<u32>,
    #[arg(long, env = "PROFETCH_FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,
    #[arg(long, env = "PROFETCH_OPEN_DURATION_MS")]
    open_duration_ms: Option<u64>,
    #[arg(long, env = "PROFETCH_MAX_OPEN_DURATION_MS")]
    max_open_duration_ms: Option<u64>,
    #[arg(long, env = "PROFETCH_OPEN_BACKOFF_MULTIPLIER")]
    open_backoff_multiplier: Option<f64>,
    #[arg(long, env = "PROFETCH_HALF_OPEN_TRIALS")]
    half_open_trials: Option<u32>,
    #[arg(short = 'c', long, env = "PROFETCH_CONCURRENCY")]
    concurrency: Option<usize>,
    #[arg(long, env = "PROFETCH_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,
}

impl BudgetArgs {
    fn overrides(&self) -> BudgetOverrides {
        BudgetOverrides {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            min_delay_ms: self.min_delay_ms,
            jitter_fraction: self.jitter_fraction,
            humanize_min: self.humanize_min,
            humanize_max: self.humanize_max,
            tokens_per_second: self.tokens_per_second,
            bucket_capacity: self.bucket_capacity,
            failure_threshold: self.failure_threshold,
            open_duration_ms: self.open_duration_ms,
            max_open_duration_ms: self.max_open_duration_ms,
            open_backoff_multiplier: self.open_backoff_multiplier,
            half_open_trials: self.half_open_trials,
            concurrency: self.concurrency,
            request_timeout_ms: self.request_timeout_ms,
        }
    }

    /// Defaults, then the config file, then flags and environment.
    fn resolve(&self) -> Result<Budget> {
        let file = match &self.config {
            Some(path) => BudgetOverrides::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => BudgetOverrides::default(),
        };
        let budget = file
            .merge(self.overrides())
            .apply(Budget::default())
            .context("Invalid budget")?;
        Ok(budget)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("profetch=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output,
            format,
            schema,
            min_quality,
            pointer,
            user_agent,
            allow_private_urls,
            budget,
        } => {
            let budget = budget.resolve()?;
            let schema = load_schema(schema.as_deref())?;
            let operations = parse_operations(&read_input(&input)?);
            if operations.is_empty() {
                bail!("No targets found in {input}");
            }

            let mut fetcher = match user_agent {
                Some(ua) => ReqwestFetcher::with_user_agent(&ua),
                None => ReqwestFetcher::new(),
            }
            .context("Failed to create HTTP client")?;
            if allow_private_urls {
                fetcher = fetcher.allow_private_urls();
            }
            let extractor = match pointer {
                Some(pointer) => JsonExtractor::at_pointer(pointer),
                None => JsonExtractor::new(),
            };

            let writer = open_output(output.as_deref())?;
            let mut exporter: Box<dyn Exporter> = match format {
                Format::Jsonl => {
                    Box::new(JsonLinesExporter::new(writer).with_min_quality(min_quality))
                }
                Format::Csv => Box::new(CsvExporter::new(writer).with_min_quality(min_quality)),
            };

            cmd_run(
                operations,
                budget,
                schema,
                min_quality,
                fetcher,
                extractor,
                exporter.as_mut(),
            )
            .await?;
        }
        Commands::Score {
            record,
            schema,
            min_quality,
        } => {
            let schema = load_schema(schema.as_deref())?;
            cmd_score(&read_input(&record)?, &schema, min_quality)?;
        }
    }

    Ok(())
}

async fn cmd_run(
    operations: Vec<Operation>,
    budget: Budget,
    schema: QualitySchema,
    min_quality: f64,
    fetcher: ReqwestFetcher,
    extractor: JsonExtractor,
    exporter: &mut dyn Exporter,
) -> Result<()> {
    tracing::info!(
        targets = operations.len(),
        concurrency = budget.concurrency,
        max_attempts = budget.max_attempts,
        tokens_per_second = budget.tokens_per_second,
        "Starting run"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling remaining operations");
                cancel.cancel();
            }
        });
    }

    let registry = TargetRegistry::new(&budget);
    let results = OrchestrationLoop::new(
        RetryingExecutor::new(fetcher, extractor),
        registry.clone(),
        budget,
    )
    .with_schema(schema)
    .with_min_quality(min_quality)
    .run(operations, cancel);

    let stats = export_all(results, exporter, min_quality)
        .await
        .context("Failed to export results")?
        .with_breaker_trips(registry.total_trips());

    for breaker in registry.breaker_stats().iter().filter(|s| s.trips > 0) {
        tracing::warn!(
            circuit = %breaker.name,
            trips = breaker.trips,
            state = %breaker.state,
            last_error = ?breaker.last_error,
            "Target was blocked during the run"
        );
    }
    tracing::info!(
        total = stats.total,
        succeeded = stats.succeeded,
        success_rate = %format!("{:.1}%", stats.success_rate() * 100.0),
        "Run complete"
    );
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

fn cmd_score(raw: &str, schema: &QualitySchema, min_quality: f64) -> Result<()> {
    let report = score_record(raw, schema)?;

    if report.passes(min_quality) {
        tracing::info!(score = report.overall_score, "Record passes quality threshold");
    } else {
        tracing::warn!(
            score = report.overall_score,
            min_quality,
            missing = ?report.missing_fields(),
            "Record below quality threshold"
        );
    }
    for suggestion in &report.suggestions {
        tracing::info!(%suggestion, "Suggestion");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn score_record(raw: &str, schema: &QualitySchema) -> Result<QualityReport> {
    let record: Record = serde_json::from_str(raw).context("Record must be a JSON object")?;
    Ok(QualityAnalyzer::new().score(&record, schema))
}

fn load_schema(path: Option<&Path>) -> Result<QualitySchema> {
    match path {
        Some(path) => QualitySchema::load(path)
            .with_context(|| format!("Failed to load schema {}", path.display())),
        None => Ok(QualitySchema::profile()),
    }
}

/// Read a file, or stdin when `source` is `-`.
fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))
    }
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("Failed to create output {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout())),
    })
}

/// One operation per non-empty line: `<target>` or `<key> <target>`.
fn parse_operations(input: &str) -> Vec<Operation> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, target)) => Operation::new(key, target.trim()),
            None => Operation::from_target(line),
        })
        .collect()
}
