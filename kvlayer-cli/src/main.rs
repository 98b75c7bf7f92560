use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use kvlayer::{Database, DatabaseConfig};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kvlayer-cli")]
#[command(about = "kvlayer CLI - inspect and edit a buffered key-value database", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Storage driver (memory, dirty)
    #[arg(short = 'd', long)]
    driver: Option<String>,

    /// Backing file for the dirty driver
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Read cache capacity (0 disables the cache)
    #[arg(long)]
    cache: Option<usize>,

    /// Flush interval in milliseconds (0 writes synchronously)
    #[arg(long)]
    write_interval: Option<u64>,

    /// Store raw strings instead of JSON documents
    #[arg(long)]
    no_json: bool,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Args {
    fn database_config(&self) -> Result<DatabaseConfig> {
        let mut config = match &self.config {
            Some(path) => DatabaseConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DatabaseConfig::default(),
        };

        if let Some(driver) = &self.driver {
            config.driver = driver.clone();
        }
        if let Some(file) = &self.file {
            config.driver_settings.filename = Some(file.clone());
            if self.driver.is_none() && self.config.is_none() {
                config.driver = "dirty".to_string();
            }
        }
        if let Some(cache) = self.cache {
            config.cache.cache_capacity = Some(cache);
        }
        if let Some(interval) = self.write_interval {
            config.cache.write_interval_ms = Some(interval);
        }
        if self.no_json {
            config.cache.json_encode = Some(false);
        }

        Ok(config)
    }
}

struct KvClient {
    db: Database,
}

impl KvClient {
    async fn open(config: &DatabaseConfig) -> Result<Self> {
        let db = Database::open(config)?;
        db.init().await?;
        Ok(Self { db })
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "GET" => self.cmd_get(args).await?,
            "SET" => self.cmd_set(args).await?,
            "DEL" | "DELETE" => self.cmd_del(args).await?,
            "KEYS" => self.cmd_keys(args).await?,
            "GETSUB" => self.cmd_getsub(args).await?,
            "SETSUB" => self.cmd_setsub(args).await?,
            "FLUSH" => self.cmd_flush().await,
            "INFO" | "STATS" => self.cmd_stats(),
            "METRICS" => kvlayer::metrics::encode_metrics()
                .map_err(|e| anyhow::anyhow!("failed to encode metrics: {}", e))?,
            "HELP" => self.help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    /// Interpret a command argument as a stored value
    fn parse_value(&self, raw: &str) -> Value {
        if !self.db.settings().json_encode {
            return Value::String(raw.to_string());
        }
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    fn format_value(value: Option<Value>) -> String {
        match value {
            None => "(nil)".dimmed().to_string(),
            Some(Value::String(s)) => format!("\"{}\"", s),
            Some(other) => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        }
    }

    fn split_path(path: &str) -> Vec<&str> {
        path.split('.').filter(|s| !s.is_empty()).collect()
    }

    async fn cmd_get(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: GET key"));
        }

        let value: Option<Value> = self.db.get(&args[0]).await?;
        Ok(Self::format_value(value))
    }

    async fn cmd_set(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: SET key value"));
        }

        let value = self.parse_value(&args[1..].join(" "));
        let ack = self.db.set(&args[0], &value).await?;
        ack.persisted().await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_del(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: DEL key [key ...]"));
        }

        let acks: Vec<_> = args.iter().map(|key| self.db.remove(key)).collect();
        for ack in acks {
            ack.await?.persisted().await?;
        }
        Ok(format!("(integer) {}", args.len()))
    }

    async fn cmd_keys(&self, args: &[String]) -> Result<String> {
        let pattern = args.first().map(String::as_str).unwrap_or("*");
        let anti_pattern = args.get(1).map(String::as_str);

        let mut keys = self.db.find_keys(pattern, anti_pattern).await?;
        if keys.is_empty() {
            return Ok("(empty list)".dimmed().to_string());
        }

        keys.sort();
        Ok(keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{}) \"{}\"", i + 1, key))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_getsub(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: GETSUB key path.to.field"));
        }

        let path = Self::split_path(&args[1]);
        let value: Option<Value> = self.db.get_sub(&args[0], &path).await?;
        Ok(Self::format_value(value))
    }

    async fn cmd_setsub(&self, args: &[String]) -> Result<String> {
        if args.len() < 3 {
            return Err(anyhow::anyhow!("Usage: SETSUB key path.to.field value"));
        }

        let path = Self::split_path(&args[1]);
        let value = self.parse_value(&args[2..].join(" "));
        let ack = self.db.set_sub(&args[0], &path, &value).await?;
        ack.persisted().await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_flush(&self) -> String {
        let flushed = self.db.flush().await;
        format!("(integer) {}", flushed)
    }

    fn cmd_stats(&self) -> String {
        let settings = self.db.settings();
        let stats = self.db.stats();

        format!(
            r#"{}
driver:               {}
cache_capacity:       {}
write_interval_ms:    {}
json_encode:          {}

{}
entries:              {}
dirty_entries:        {}
reads:                {}
cache_hits:           {}
driver_reads:         {}
hit_rate:             {:.2}%
writes:               {}
writes_obsoleted:     {}
flushes:              {}
flushed_operations:   {}
flush_failures:       {}
evictions:            {}"#,
            "# Settings".bold(),
            self.db.layer().driver_name(),
            settings.cache_capacity,
            settings.write_interval_ms,
            settings.json_encode,
            "# Buffer".bold(),
            stats.entries,
            stats.dirty_entries,
            stats.reads,
            stats.cache_hits,
            stats.driver_reads,
            stats.hit_rate() * 100.0,
            stats.writes,
            stats.writes_obsoleted,
            stats.flushes,
            stats.flushed_operations,
            stats.flush_failures,
            stats.evictions,
        )
    }

    fn help_text(&self) -> String {
        format!(
            r#"{}

{}
  GET key                      Get the value of key
  SET key value                Set key (JSON value, or a plain string)
  DEL key [key ...]            Remove one or more keys

{}
  GETSUB key path.to.field     Get a nested field
  SETSUB key path.to.field v   Replace a nested field

{}
  KEYS [pattern] [exclude]     Find keys matching a glob pattern

{}
  FLUSH                        Flush buffered writes now
  STATS                        Show settings and buffer statistics
  METRICS                      Show Prometheus metrics
  HELP                         Show this help message
  QUIT                         Exit the CLI
"#,
            "kvlayer CLI - Available Commands".bold().cyan(),
            "Basic Commands:".bold(),
            "Nested Values:".bold(),
            "Key Discovery:".bold(),
            "Buffer Commands:".bold(),
        )
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await?;
        Ok(())
    }
}

fn init_tracing(config: &DatabaseConfig) {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("kvlayer_cli=info,kvlayer={}", config.logging.level));
    let filter = tracing_subscriber::EnvFilter::new(filter);

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stdout)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.database_config()?;
    init_tracing(&config);

    let client = KvClient::open(&config).await?;

    // Check if running in command mode or interactive mode
    let outcome = if !args.command.is_empty() {
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        match client.execute_command(cmd, &cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        run_interactive(&client, &config).await
    };

    client.close().await?;

    if let Err(e) = outcome {
        error!(error = %e, "{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
    Ok(())
}

async fn run_interactive(client: &KvClient, config: &DatabaseConfig) -> Result<()> {
    info!(
        "{}",
        format!("kvlayer CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Using driver {}", config.driver);
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("kvlayer {}", config.driver).green());
        let readline = rl.readline(&prompt);

        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match client.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
