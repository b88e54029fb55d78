use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use mail_triage::cli::{self, AccountCommand, CacheCommand, Cli, Commands};
use mail_triage::config::Config;
use mail_triage::error::TriageError;
use mail_triage::service::TriageService;
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Routes log lines through MultiProgress so they print above the spinner
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut buffer) = self.buffer.lock() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter {
            multi: Arc::clone(&self.multi),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: mail-triage --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Both the Gmail client and the IMAP TLS stream use rustls
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mail_triage=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mail_triage=info,warn"))
    };

    let multi = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if let Commands::InitConfig { output, force } = &cli.command {
        if output.exists() && !force {
            anyhow::bail!(
                "Config file already exists at {:?}. Use --force to overwrite.",
                output
            );
        }
        Config::create_example(output).await?;
        println!("Created example configuration at {:?}", output);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    let service = TriageService::from_config(&config)?;

    match cli.command {
        Commands::Account(command) => run_account(&service, &multi, command).await,

        Commands::Search {
            query,
            accounts,
            mailboxes,
            max_results,
            min_urgency,
            min_importance,
        } => {
            let account_ids = resolve_ids(&service, &accounts)?;
            let params = cli::search_params(
                query,
                account_ids,
                mailboxes,
                max_results,
                min_urgency,
                min_importance,
            );

            let pb = cli::spinner(&multi, "Searching accounts...");
            let response = service.search_emails(params).await;
            pb.finish_and_clear();
            cli::print_json(&response?)
        }

        Commands::Urgent {
            max_results,
            accounts,
            only_unread,
        } => {
            let account_ids = resolve_ids(&service, &accounts)?;
            let params = cli::urgent_params(account_ids, max_results, only_unread);

            let pb = cli::spinner(&multi, "Checking for urgent mail...");
            let response = service.get_urgent_emails(params).await;
            pb.finish_and_clear();
            cli::print_json(&response?)
        }

        Commands::Mailboxes { account } => {
            let account = service.find_account(&account)?;
            let mailboxes = service.list_mailboxes(&account.id).await?;
            cli::print_json(&mailboxes)
        }

        Commands::Cache(CacheCommand::Show { account }) => {
            let account = service.find_account(&account)?;
            cli::print_json(&service.cached_results(&account.id)?)
        }

        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn run_account(
    service: &TriageService,
    multi: &MultiProgress,
    command: AccountCommand,
) -> Result<()> {
    match command {
        AccountCommand::Add(args) => {
            let account = service.add_account(args.into())?;
            tracing::info!("Registered account '{}' ({})", account.name, account.id);
            cli::print_json(&account)
        }
        AccountCommand::List { all } => cli::print_json(&service.list_accounts(all)?),
        AccountCommand::Remove { account } => {
            let account = service.find_account(&account)?;
            service.remove_account(&account.id)?;
            println!("Removed account '{}'", account.name);
            Ok(())
        }
        AccountCommand::Enable { account } => {
            let account = service.find_account(&account)?;
            cli::print_json(&service.enable_account(&account.id)?)
        }
        AccountCommand::Disable { account } => {
            let account = service.find_account(&account)?;
            cli::print_json(&service.disable_account(&account.id)?)
        }
        AccountCommand::Update(args) => {
            let account = service.find_account(&args.account)?;
            cli::print_json(&service.update_account(&account.id, args.to_update())?)
        }
        AccountCommand::Validate { account } => {
            let account = service.find_account(&account)?;
            let pb = cli::spinner(multi, &format!("Connecting to '{}'...", account.name));
            let report = service.validate_account(&account.id).await;
            pb.finish_and_clear();
            cli::print_json(&report?)
        }
    }
}

/// Accept ids, names or emails on the command line. Unknown keys are passed
/// through unchanged and dropped by the orchestrator.
fn resolve_ids(service: &TriageService, keys: &[String]) -> Result<Vec<String>> {
    keys.iter()
        .map(|key| match service.find_account(key) {
            Ok(account) => Ok(account.id),
            Err(TriageError::NotFound(_)) => Ok(key.clone()),
            Err(e) => Err(e.into()),
        })
        .collect()
}
