use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use yearbook::db::Database;
use yearbook::faces::worker::{self, WORKER_COMMAND};
use yearbook::faces::{people, Extraction, Extractor, OnnxFaceModel, WorkerCommand};
use yearbook::jobs::{JobData, JobResultData, StartedJob, WatchOutcome};
use yearbook::library::{removal_candidates, OrganizePattern, RemovalAction};
use yearbook::{logging, Config, JobView, Orchestrator};

struct Args {
    config_path: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("yearbook {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            arg if arg.starts_with('-') && command.is_empty() => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => command.push(arg.to_string()),
        }
        i += 1;
    }

    Args { config_path, command }
}

fn print_help() {
    println!(
        r#"yearbook - photo indexing and face identity resolution

USAGE:
    yearbook [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    import                          Import images from the configured media directories
    index                           Extract dates, tags and faces from imported photos
    auto-assign <person> [thresh]   Find unassigned faces matching a person
    discover [distance]             Cluster unassigned faces into candidate people
    jobs                            List recent jobs
    status <job>                    Show one job
    cancel <job>                    Cancel a pending or running job
    delete <job>                    Delete a finished job and its results
    apply <job>                     Apply auto-assign matches, or stage discovered clusters
    confirm <job> <label> <name>    Name a discovered cluster
    suggest <face> [limit]          Rank people by likeness to a face
    people                          List people
    person <name>                   Show one person
    add-person <name>               Create a person
    remove-person <id>              Delete a person (faces become unassigned)
    assign <person> <face>...       Assign faces to a person
    unassign <face>...              Unassign faces
    ignore <face>...                Ignore faces
    duplicates [dir]...             Find visually identical images
    remove-duplicates <job> [trash|delete|move <folder>]
                                    Keep the first image of each group found by a duplicates job
    organize <source> [dest] [--pattern year|year_month|year_month_day] [--copy]
                                    Sort images into dated folders
    recover                         Finalise jobs left unfinished by a crash
    cleanup                         Remove missing photos and unused thumbnails
    extract-worker                  Serve extraction requests on stdin (started by index)

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    YEARBOOK_CONFIG     Path to config file (overrides default location)
    YEARBOOK_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/yearbook/config.toml"#
    );
}

fn arg<'a>(rest: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument <{name}>"))
}

fn parse_ids(rest: &[String]) -> Result<Vec<i64>> {
    if rest.is_empty() {
        bail!("Expected at least one face id");
    }
    rest.iter()
        .map(|s| s.parse().with_context(|| format!("Invalid id: {s}")))
        .collect()
}

fn print_job(view: &JobView) {
    println!(
        "{}  {:<18} {:<10} {:>5.1}%  done {} / err {} / cancelled {} of {}{}",
        view.id,
        view.name,
        view.status.as_str(),
        view.progress_percent,
        view.completed_count,
        view.error_count,
        view.cancelled_count,
        view.task_count,
        if view.was_forced() { "  (forced)" } else { "" }
    );
}

/// Print progress once a second until the job finishes. Ctrl-C cancels it.
async fn follow(orchestrator: &Orchestrator, started: StartedJob) -> Result<()> {
    let StartedJob {
        job_id,
        task_count,
        watcher,
    } = started;
    println!("Started job {job_id} with {task_count} item(s)");

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                if orchestrator.cancel_job(&job_id)? {
                    println!("\nCancelling, waiting for running batches to notice...");
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let Some(view) = orchestrator.get_job(&job_id)? else {
            println!("\nJob was deleted");
            return Ok(());
        };
        print!(
            "\r{:>5.1}%  {} done, {} errors, {} cancelled",
            view.progress_percent, view.completed_count, view.error_count, view.cancelled_count
        );
        std::io::stdout().flush()?;
        if view.status.is_terminal() {
            println!();
            break;
        }
    }

    let outcome = tokio::task::spawn_blocking(move || watcher.join())
        .await?
        .map_err(|_| anyhow!("Completion watcher panicked"))??;
    // A cancelled or forced job can still have batches writing to the store
    tokio::task::block_in_place(|| orchestrator.wait_idle());
    if outcome == WatchOutcome::Forced {
        println!("Job did not finish in time and was force-completed");
    }
    if let Some(view) = orchestrator.get_job(&job_id)? {
        print_job(&view);
    }
    Ok(())
}

/// Extraction runs in `extract-worker` child processes, so a photo that hangs
/// the decoder or the model can be killed without taking the job down.
fn orchestrator(config: Config, config_path: Option<&Path>) -> Result<Orchestrator> {
    let command = WorkerCommand::current_exe(config_path)?;
    Orchestrator::new(config, Extraction::workers(command))
}

fn parse_removal_action(rest: &[String]) -> Result<RemovalAction> {
    match rest.first().map(String::as_str) {
        None | Some("trash") => Ok(RemovalAction::Trash),
        Some("delete") => Ok(RemovalAction::Delete),
        Some("move") => Ok(RemovalAction::MoveTo {
            folder: PathBuf::from(arg(rest, 1, "folder")?),
        }),
        Some(other) => bail!("Unknown action {other:?}, expected trash, delete or move"),
    }
}

async fn run(config: Config, config_path: Option<&Path>, command: &str, rest: &[String]) -> Result<()> {
    match command {
        "import" => {
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_import()?;
            follow(&orchestrator, started).await
        }
        "index" => {
            // Download once here rather than racing in every worker
            OnnxFaceModel::new(&config.faces)
                .fetch_models()
                .context("Face models are not available")?;
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_index()?;
            follow(&orchestrator, started).await
        }
        WORKER_COMMAND => {
            let model = OnnxFaceModel::new(&config.faces);
            model.warm_up().context("Face models are not available")?;
            let extractor = Extractor::new(Arc::new(model), config.library.thumbnail_size);
            tokio::task::spawn_blocking(move || {
                worker::serve(&extractor, std::io::stdin().lock(), std::io::stdout().lock())
            })
            .await?
        }
        "auto-assign" => {
            let person_id: i64 = arg(rest, 0, "person")?.parse().context("Invalid person id")?;
            let threshold = match rest.get(1) {
                Some(t) => Some(t.parse::<f32>().context("Invalid threshold")?),
                None => None,
            };
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_auto_assign(person_id, threshold)?;
            follow(&orchestrator, started).await
        }
        "discover" => {
            let distance = match rest.first() {
                Some(d) => Some(d.parse::<f32>().context("Invalid distance")?),
                None => None,
            };
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_discovery(distance)?;
            follow(&orchestrator, started).await
        }
        "duplicates" => {
            let directories = rest.iter().map(PathBuf::from).collect();
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_find_duplicates(directories)?;
            let job_id = started.job_id.clone();
            follow(&orchestrator, started).await?;
            let groups = orchestrator.duplicates_from_job(&job_id)?;
            println!("{} group(s) of duplicates; remove them with `remove-duplicates {job_id}`", groups.len());
            Ok(())
        }
        "remove-duplicates" => {
            let job_id = arg(rest, 0, "job")?;
            let action = parse_removal_action(&rest[1..])?;
            let orchestrator = orchestrator(config, config_path)?;
            let paths = removal_candidates(&orchestrator.duplicates_from_job(job_id)?);
            let started = orchestrator.start_remove_duplicates(paths, action)?;
            follow(&orchestrator, started).await
        }
        "organize" => {
            let mut pattern = OrganizePattern::default();
            let mut copy = false;
            let mut dirs = Vec::new();
            let mut args = rest.iter();
            while let Some(a) = args.next() {
                match a.as_str() {
                    "--copy" => copy = true,
                    "--pattern" => {
                        let value = args.next().ok_or_else(|| anyhow!("--pattern requires a value"))?;
                        pattern = OrganizePattern::parse(value).ok_or_else(|| anyhow!("Unknown pattern {value:?}"))?;
                    }
                    _ => dirs.push(PathBuf::from(a)),
                }
            }
            let source = dirs.first().ok_or_else(|| anyhow!("Missing argument <source>"))?;
            let orchestrator = orchestrator(config, config_path)?;
            let started = orchestrator.start_organize(source, dirs.get(1).map(PathBuf::as_path), pattern, copy)?;
            follow(&orchestrator, started).await
        }
        "jobs" => {
            for view in orchestrator(config, config_path)?.list_jobs(20)? {
                print_job(&view);
            }
            Ok(())
        }
        "status" => {
            let job_id = arg(rest, 0, "job")?;
            let orchestrator = orchestrator(config, config_path)?;
            let view = orchestrator
                .get_job(job_id)?
                .ok_or_else(|| anyhow!("Job {job_id} not found"))?;
            print_job(&view);
            for result in orchestrator.job_results(job_id)? {
                match result {
                    JobResultData::Matches { matches } => {
                        for m in matches {
                            println!("  face {:>6}  similarity {:.3}", m.face_id, m.similarity);
                        }
                    }
                    JobResultData::Clusters { clusters } => {
                        for c in clusters {
                            println!("  {:<12} {} face(s): {:?}", c.label, c.face_ids.len(), c.face_ids);
                        }
                    }
                    JobResultData::Duplicates { groups } => {
                        for group in groups {
                            println!("  group {}:", group.id);
                            for path in group.paths {
                                println!("    {}", path.display());
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        "cancel" => {
            let job_id = arg(rest, 0, "job")?;
            if orchestrator(config, config_path)?.cancel_job(job_id)? {
                println!("Cancelled {job_id}");
            } else {
                println!("Job {job_id} is not pending or running");
            }
            Ok(())
        }
        "delete" => {
            let job_id = arg(rest, 0, "job")?;
            if orchestrator(config, config_path)?.delete_job(job_id)? {
                println!("Deleted {job_id}");
            } else {
                println!("Job {job_id} not found");
            }
            Ok(())
        }
        "apply" => {
            let job_id = arg(rest, 0, "job")?;
            let db = Database::open_initialized(&config.db_path)?;
            let job = db.get_job(job_id)?.ok_or_else(|| anyhow!("Job {job_id} not found"))?;
            match job.data()? {
                JobData::AutoAssignFaces { person_name, .. } => {
                    let assigned = people::apply_auto_assign_results(&db, job_id)?;
                    println!("Assigned {assigned} face(s) to {person_name}");
                }
                JobData::DiscoverPeople { .. } => {
                    let staged = people::stage_clusters(&db, job_id)?;
                    println!("Created {} pending person(s); name them with `confirm`", staged.len());
                }
                other => bail!("Nothing to apply for a {} job", other.name()),
            }
            Ok(())
        }
        "confirm" => {
            let job_id = arg(rest, 0, "job")?;
            let label = arg(rest, 1, "label")?;
            let name = rest.get(2..).map(|n| n.join(" ")).unwrap_or_default();
            let db = Database::open_initialized(&config.db_path)?;
            let person_id = people::confirm_cluster(&db, job_id, label, &name)?;
            println!("{label} is now {name} (person {person_id})");
            Ok(())
        }
        "suggest" => {
            let face_id: i64 = arg(rest, 0, "face")?.parse().context("Invalid face id")?;
            let limit = match rest.get(1) {
                Some(l) => l.parse::<usize>().context("Invalid limit")?,
                None => 5,
            };
            let db = Database::open_initialized(&config.db_path)?;
            for (person, score) in people::suggest_people(&db, face_id, limit)? {
                println!("{:>5}  {:<24} similarity {:.3}", person.id, person.name, score);
            }
            Ok(())
        }
        "people" => {
            let db = Database::open_initialized(&config.db_path)?;
            for person in db.get_all_people()? {
                println!(
                    "{:>5}  {:<24} {:>5} face(s){}",
                    person.id,
                    person.name,
                    person.face_count,
                    if person.pending_confirmation { "  (pending)" } else { "" }
                );
            }
            Ok(())
        }
        "person" => {
            let name = rest.join(" ");
            let db = Database::open_initialized(&config.db_path)?;
            let person = db
                .find_person_by_name(&name)?
                .ok_or_else(|| anyhow!("No person named {name:?}"))?;
            println!("{} (id {}), {} face(s)", person.name, person.id, person.face_count);
            for embedding in db.get_person_embeddings(person.id)? {
                println!("  {}: {} face(s)", embedding.year, embedding.included_face_ids.len());
            }
            Ok(())
        }
        "add-person" => {
            let db = Database::open_initialized(&config.db_path)?;
            let id = people::create_person(&db, &rest.join(" "))?;
            println!("Created person {id}");
            Ok(())
        }
        "remove-person" => {
            let person_id: i64 = arg(rest, 0, "id")?.parse().context("Invalid person id")?;
            let db = Database::open_initialized(&config.db_path)?;
            if people::delete_person(&db, person_id)? {
                println!("Deleted person {person_id}");
            } else {
                println!("Person {person_id} not found");
            }
            Ok(())
        }
        "assign" => {
            let person_id: i64 = arg(rest, 0, "person")?.parse().context("Invalid person id")?;
            let face_ids = parse_ids(&rest[1..])?;
            let db = Database::open_initialized(&config.db_path)?;
            let changed = people::assign_faces(&db, person_id, &face_ids)?;
            println!("Assigned {changed} face(s)");
            Ok(())
        }
        "unassign" | "ignore" => {
            let face_ids = parse_ids(rest)?;
            let db = Database::open_initialized(&config.db_path)?;
            let changed = if command == "ignore" {
                people::ignore_faces(&db, &face_ids)?
            } else {
                people::unassign_faces(&db, &face_ids)?
            };
            println!("Updated {changed} face(s)");
            Ok(())
        }
        "recover" => {
            let orchestrator = orchestrator(config, config_path)?;
            let watchers = orchestrator.recover_unfinished_jobs()?;
            println!("Waiting on {} unfinished job(s)", watchers.len());
            for (job_id, handle) in watchers {
                let outcome = tokio::task::spawn_blocking(move || handle.join())
                    .await?
                    .map_err(|_| anyhow!("Completion watcher panicked"))??;
                println!("{job_id}: {outcome:?}");
            }
            tokio::task::block_in_place(|| orchestrator.wait_idle());
            Ok(())
        }
        "cleanup" => {
            let orchestrator = orchestrator(config, config_path)?;
            let photos = orchestrator.delete_orphaned_photos()?;
            let thumbnails = orchestrator.delete_orphaned_thumbnails()?;
            println!("Removed {photos} missing photo(s) and {thumbnails} unused thumbnail(s)");
            Ok(())
        }
        other => {
            print_help();
            bail!("Unknown command: {other}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let Some((command, rest)) = args.command.split_first() else {
        print_help();
        return Ok(());
    };

    run(config, args.config_path.as_deref(), command, rest).await
}
