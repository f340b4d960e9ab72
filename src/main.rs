use std::{process, sync::Arc};

use canopy::{
    application::error::AppError,
    cache::{CacheConfig, CacheCoordinator, PostCountAudit},
    config,
    domain::{ActivityScope, NodeId},
    infra::{error::InfraError, memory::MemoryStore, telemetry},
};
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(i32::from(error.exit_code()));
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, messages = ?error.report().messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Stats(config::StatsArgs::default()));

    telemetry::init(&settings.logging)?;

    let store = match &settings.store.seed {
        Some(path) => Arc::new(MemoryStore::load(path).await?),
        None => {
            warn!("No seed configured; starting from an empty store");
            Arc::new(MemoryStore::new())
        }
    };

    let coordinator = CacheCoordinator::new(CacheConfig::from(&settings.cache), store);
    let availability = coordinator.initialize_all().await?;
    coordinator.start();
    info!(
        post_counts = availability.post_counts.as_str(),
        activity = availability.activity.as_str(),
        file_stats = availability.file_stats.as_str(),
        "Caches initialized"
    );

    let result = match command {
        config::Command::Stats(args) => run_stats(&coordinator, &settings, args).await,
        config::Command::Audit(args) => run_audit(&coordinator, args).await,
    };

    coordinator.stop().await;
    result
}

async fn run_stats(
    coordinator: &CacheCoordinator,
    settings: &config::Settings,
    args: config::StatsArgs,
) -> Result<(), AppError> {
    let today = OffsetDateTime::now_utc().date();
    let months = settings.cache.activity_window_months;

    let Some(raw) = args.node else {
        let stats = coordinator.stats();
        let activity = coordinator
            .get_activity(ActivityScope::All, true, today, months)
            .await?;
        println!("categories        {}", stats.nodes);
        println!("posts             {}", coordinator.get_total_post_count());
        println!(
            "posts ({months} months) {} over {} active days",
            activity.stats.total, activity.stats.active_days
        );
        println!(
            "caches            post_counts={} activity={} file_stats={}",
            stats.availability.post_counts.as_str(),
            stats.availability.activity.as_str(),
            stats.availability.file_stats.as_str()
        );
        println!(
            "cached windows    flat={} recursive={}",
            stats.activity.flat_windows, stats.activity.recursive_windows
        );
        println!(
            "cached file stats flat={} recursive={}",
            stats.file_stats.flat_entries, stats.file_stats.recursive_entries
        );
        return Ok(());
    };

    let node = NodeId::new(raw);
    let files = coordinator.get_file_stats(node, true).await?;
    let activity = coordinator
        .get_activity(ActivityScope::Node(node), true, today, months)
        .await?;
    println!("category          {node}");
    println!("posts (direct)    {}", coordinator.get_post_count(node));
    println!("posts (subtree)   {}", coordinator.get_post_count_recursive(node));
    println!(
        "files (subtree)   {} files, {} bytes",
        files.file_count, files.total_size
    );
    println!(
        "activity          {} posts, busiest day {}",
        activity.stats.total, activity.stats.max_day
    );
    Ok(())
}

async fn run_audit(
    coordinator: &CacheCoordinator,
    args: config::AuditArgs,
) -> Result<(), AppError> {
    let audits: Vec<PostCountAudit> = match args.node {
        Some(raw) => vec![coordinator.audit_post_count(NodeId::new(raw)).await?],
        None => coordinator.audit_all().await?,
    };

    let drifted: Vec<&PostCountAudit> = audits.iter().filter(|a| !a.is_consistent()).collect();
    for audit in &drifted {
        println!(
            "category {}: cached {} stored {} (drift {:+})",
            audit.node,
            audit.cached,
            audit.stored,
            audit.drift()
        );
    }
    println!(
        "audited {} categories, {} drifted",
        audits.len(),
        drifted.len()
    );

    if args.strict && !drifted.is_empty() {
        return Err(AppError::validation(format!(
            "post count drift detected in {} categories",
            drifted.len()
        )));
    }
    Ok(())
}
