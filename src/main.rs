//! wsync: client CLI
//!
//! `plan` prints what would change, `sync` pulls NEW/UPDATE files,
//! `delete` removes local folders/files, `prune` removes everything the host
//! no longer has.

use anyhow::{bail, Context, Result};
use clap::Parser;

use wsync::cli::{ClientCommand, ClientOpts};
use wsync::config::{load_settings, save_settings, settings_path, Settings};
use wsync::plan::{Action, Destination, Level, PlanItem};
use wsync::progress::SyncProgress;
use wsync::url::parse_server_addr;
use wsync::{logger, ClientSession, Overrides};

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    let _log_guard = logger::init(opts.verbose, opts.log_dir.as_deref());

    let config_path = opts.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings(&config_path);
    apply_flags(&opts, &mut settings)?;
    if opts.save {
        save_settings(&config_path, &settings)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts, settings))
}

fn apply_flags(opts: &ClientOpts, settings: &mut Settings) -> Result<()> {
    if let Some(server) = &opts.server {
        let Some(addr) = parse_server_addr(server) else {
            bail!("invalid server address: {}", server);
        };
        settings.client.server_ip = addr.host;
        settings.client.server_port = addr.port;
    }
    if let Some(assets) = &opts.assets {
        settings.client.assets_path = assets.clone();
    }
    if let Some(mods) = &opts.mods {
        settings.client.mods_path = mods.clone();
    }
    Ok(())
}

async fn run(opts: ClientOpts, settings: Settings) -> Result<()> {
    let mut session = ClientSession::new(settings.client.address(), settings.client.roots());

    if let ClientCommand::Delete { keys } = &opts.command {
        let stats = session.delete_local(keys.as_slice()).await?;
        println!(
            "Deleted {} files, {} folders",
            stats.files_deleted, stats.folders_deleted
        );
        return Ok(());
    }

    session
        .connect()
        .await
        .with_context(|| format!("connect to {}", session.server_addr()))?;

    let mut overrides = opts.overrides();
    let defaulted = session.resolve_mixed(&overrides, &|folder_id: &str| {
        tracing::warn!(
            "folder {} holds both .crp and .dll files; using Assets (pass --to-mods {} to change)",
            folder_id,
            folder_id
        );
        Destination::Assets
    });
    overrides.extend(defaulted);

    let result = match &opts.command {
        ClientCommand::Plan { all } => {
            let plan = session.build_plan(&overrides).await?;
            print_plan(&plan, *all);
            Ok(())
        }
        ClientCommand::Sync { keys, all } => {
            let keys: Vec<String> = if *all {
                session
                    .classification()
                    .iter()
                    .map(|(id, _)| id.to_string())
                    .collect()
            } else {
                keys.clone()
            };
            sync(&mut session, &keys, &overrides).await
        }
        ClientCommand::Prune => {
            let plan = session.build_plan(&overrides).await?;
            let keys: Vec<&str> = plan
                .iter()
                .filter(|item| item.action == Action::Delete && item.level == Level::Folder)
                .map(|item| item.key.as_str())
                .collect();
            if keys.is_empty() {
                println!("Nothing to prune");
            } else {
                let stats = session.delete_local(keys.as_slice()).await?;
                println!(
                    "Deleted {} files, {} folders",
                    stats.files_deleted, stats.folders_deleted
                );
            }
            Ok(())
        }
        ClientCommand::Delete { .. } => Ok(()),
    };

    session.close();
    result
}

async fn sync(
    session: &mut ClientSession,
    keys: &[String],
    overrides: &Overrides,
) -> Result<()> {
    if keys.is_empty() {
        bail!("nothing selected: pass folder/file keys or --all");
    }

    let progress = SyncProgress::new(false);
    progress.stage("checking local files");
    let stats = session
        .synchronize(keys, overrides, |done, total| progress.update(done, total))
        .await?;
    progress.finish("Sync finished");
    println!("{}", stats);

    if !session.is_connected() {
        bail!(
            "connection lost after {} of {} files",
            stats.transferred_files,
            stats.to_transfer
        );
    }
    Ok(())
}

fn print_plan(plan: &[PlanItem], all: bool) {
    let mut counts = [0usize; 4];
    for item in plan {
        if item.level == Level::File {
            counts[item.action as usize] += 1;
        }
        if !all && item.action == Action::Same {
            continue;
        }
        match item.level {
            Level::Folder => println!("{:<6}  {}  -> {}", item.action, item.key, item.target.display()),
            Level::File => println!("{:<6}    {}", item.action, item.key),
        }
    }
    println!(
        "\n{} same, {} new, {} update, {} delete",
        counts[Action::Same as usize],
        counts[Action::New as usize],
        counts[Action::Update as usize],
        counts[Action::Delete as usize]
    );
}
