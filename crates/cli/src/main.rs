use clap::{Parser, Subcommand};
use orchestrator::{Config, Orchestrator, PatchUpload, ValidationReport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qmdmatrix", version)]
#[command(about = "Validate QMD patches against a matrix of firmware targets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate patch files (or a directory of them) against every firmware.
    Validate {
        /// Patch files, or a directory whose layout is preserved.
        paths: Vec<PathBuf>,
        /// Print the raw aggregated JSON instead of tables.
        #[arg(long)]
        json: bool,
    },
    /// List the loaded hashtables.
    Hashtables,
    /// List the discovered QML source trees.
    Trees,
    /// List OS versions that have both a hashtable and a matching tree.
    Versions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        // No .env file; plain environment variables apply.
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match &cli.command {
        Commands::Validate { paths, json } => cmd_validate(&config, paths, *json).await?,
        Commands::Hashtables => cmd_hashtables(&config)?,
        Commands::Trees => cmd_trees(&config)?,
        Commands::Versions => cmd_versions(&config)?,
    }

    Ok(())
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let hashtabs = Arc::new(catalog::HashtabService::new(&config.hashtab_dir)?);
    let trees = Arc::new(catalog::TreeService::new(&config.tree_dir)?);
    let jobs = jobs::JobStore::new();
    jobs.start_janitor();
    Ok(Orchestrator::new(
        hashtabs,
        trees,
        jobs,
        applier::Applier::new(&config.applier_binary),
        config.max_concurrent_validations,
    ))
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

async fn cmd_validate(config: &Config, paths: &[PathBuf], json: bool) -> anyhow::Result<()> {
    if paths.is_empty() {
        anyhow::bail!("no patch files given");
    }

    let uploads = collect_uploads(paths)?;
    if uploads.is_empty() {
        anyhow::bail!("no .qmd files found under the given paths");
    }
    info!(count = uploads.len(), "staging patches");

    let orch = build_orchestrator(config)?;
    let job_id = uuid::Uuid::new_v4().to_string();
    orch.jobs().create(&job_id);

    // Live progress on stderr while the matrix runs.
    let (mut rx, subscription) = orch.jobs().subscribe(&job_id);
    let printer = tokio::spawn(async move {
        let mut last = -1;
        while let Some(snapshot) = rx.recv().await {
            if snapshot.progress != last {
                eprintln!("  [{:>3}%] {}", snapshot.progress, snapshot.message);
                last = snapshot.progress;
            }
            if snapshot.status.is_terminal() {
                break;
            }
        }
    });

    orch.validate(uploads, &job_id).await;
    // Unregistering closes the channel, so the printer always terminates even
    // if the final snapshot was dropped on a full buffer.
    drop(subscription);
    printer.await.ok();

    let job = orch
        .jobs()
        .get(&job_id)
        .ok_or_else(|| anyhow::anyhow!("job vanished"))?;
    if job.status == jobs::JobStatus::Error {
        anyhow::bail!("validation failed: {}", job.message);
    }
    let results = job
        .results
        .ok_or_else(|| anyhow::anyhow!("no results recorded"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let report: ValidationReport = serde_json::from_value(results)?;
    match report {
        ValidationReport::Single(response) => print_response("patch", &response),
        ValidationReport::Batch(map) => {
            for (file, response) in &map {
                print_response(file, response);
            }
        }
    }

    Ok(())
}

fn collect_uploads(paths: &[PathBuf]) -> anyhow::Result<Vec<PatchUpload>> {
    let mut uploads = Vec::new();

    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let is_qmd = entry
                    .path()
                    .extension()
                    .and_then(|x| x.to_str())
                    .map(|x| x.eq_ignore_ascii_case("qmd"))
                    .unwrap_or(false);
                if !is_qmd {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                uploads.push(PatchUpload {
                    path: rel,
                    bytes: std::fs::read(entry.path())?,
                });
            }
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            uploads.push(PatchUpload {
                path: name,
                bytes: std::fs::read(path)?,
            });
        }
    }

    Ok(uploads)
}

fn print_response(file: &str, response: &orchestrator::CompareResponse) {
    println!("+------------------------------------------+");
    println!("| {:<40} |", truncate(file, 40));
    println!("+------------------------------------------+");
    println!("| Checked        : {:>22} |", response.total_checked);
    println!("| Compatible     : {:>22} |", response.compatible.len());
    println!("| Incompatible   : {:>22} |", response.incompatible.len());
    println!("+------------------------------------------+");

    for cell in &response.compatible {
        println!("  OK   {} ({} / {})", cell.hashtable, cell.os_version, cell.device);
    }
    for cell in &response.incompatible {
        println!(
            "  FAIL {} ({} / {}) - {}",
            cell.hashtable, cell.os_version, cell.device, cell.error_detail
        );
        for missing in &cell.missing_hashes {
            if missing.line > 0 {
                println!(
                    "         hash {} at line {}, column {}",
                    missing.hash, missing.line, missing.column
                );
            } else {
                println!("         hash {} (position unknown)", missing.hash);
            }
        }
    }
    println!();
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// catalog listings
// ---------------------------------------------------------------------------

fn cmd_hashtables(config: &Config) -> anyhow::Result<()> {
    let service = catalog::HashtabService::new(&config.hashtab_dir)?;
    service.check_and_reload()?;
    let tables = service.hashtables();

    println!("+------------------------------------------+");
    println!("| HASHTABLES                               |");
    println!("+------------------------------------------+");
    println!("| Count          : {:>22} |", tables.len());
    println!("+------------------------------------------+");
    for table in &tables {
        println!(
            "  {} (version {}, device {}, {} entries)",
            table.name,
            table.os_version,
            table.device,
            table.entries.len()
        );
    }
    Ok(())
}

fn cmd_trees(config: &Config) -> anyhow::Result<()> {
    let service = catalog::TreeService::new(&config.tree_dir)?;
    service.check_and_reload()?;
    let trees = service.trees();

    println!("+------------------------------------------+");
    println!("| QML TREES                                |");
    println!("+------------------------------------------+");
    println!("| Count          : {:>22} |", trees.len());
    println!("+------------------------------------------+");
    for tree in &trees {
        println!(
            "  {} (version {}, device {}, {} qml files)",
            tree.name, tree.os_version, tree.device, tree.file_count
        );
    }
    Ok(())
}

fn cmd_versions(config: &Config) -> anyhow::Result<()> {
    let orch = build_orchestrator(config)?;
    let versions = orch.validated_versions();

    if versions.is_empty() {
        println!("No fully validated versions (need a hashtable and a matching tree).");
        return Ok(());
    }
    println!("Validated versions:");
    for version in versions {
        println!("  {version}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_collect_uploads_from_directory() {
        let tmp = std::env::temp_dir().join("cli_collect");
        fs::remove_dir_all(&tmp).ok();
        fs::create_dir_all(tmp.join("deps")).ok();
        fs::write(tmp.join("mod.qmd"), "LOAD deps/a.qmd\n").ok();
        fs::write(tmp.join("deps/a.qmd"), "x\n").ok();
        fs::write(tmp.join("notes.txt"), "skip me\n").ok();

        let mut uploads = collect_uploads(&[tmp.clone()]).unwrap();
        uploads.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<&str> = uploads.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["deps/a.qmd", "mod.qmd"]);

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_collect_uploads_single_file_uses_basename() {
        let tmp = std::env::temp_dir().join("cli_collect_file");
        fs::remove_dir_all(&tmp).ok();
        fs::create_dir_all(&tmp).ok();
        fs::write(tmp.join("solo.qmd"), "x\n").ok();

        let uploads = collect_uploads(&[tmp.join("solo.qmd")]).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, "solo.qmd");

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 40), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
    }
}
