use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, TimeZone, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use m3u_matrix_lib::cache::ValidationCache;
use m3u_matrix_lib::channel::ChannelStatus;
use m3u_matrix_lib::config::AppConfig;
use m3u_matrix_lib::epg::{self, EpgData};
use m3u_matrix_lib::errors::MatrixError;
use m3u_matrix_lib::organize::{self, SortKey};
use m3u_matrix_lib::parser::{self, Playlist};
use m3u_matrix_lib::schedule::{AutoScheduler, FillStrategy, NewShow, ScheduleStore};
use m3u_matrix_lib::server::{self, ServerState};
use m3u_matrix_lib::validator::{CancelFlag, ChannelValidator, RunMode, ValidationEvent};

#[derive(clap::Parser, Debug)]
#[command(name = "m3u-matrix", version, about = "IPTV playlist manager and TV schedule center", long_about = None)]
struct Args {
    /// Run the JSON HTTP server with configured settings and no other output
    #[arg(long)]
    headless: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a playlist (file or URL) and print a summary
    Parse {
        input: String,
        /// Write the normalized playlist (.m3u or .json)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// List every channel
        #[arg(long)]
        list: bool,
    },
    /// Check which streams in a playlist are alive
    Validate {
        input: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Parallel probes (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// One probe at a time with a pause between requests
        #[arg(long)]
        sequential: bool,
        /// Per-request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Swap in a working backup URL for failed channels
        #[arg(long)]
        promote_backups: bool,
        /// Drop broken and timed-out channels from the output
        #[arg(long)]
        remove_broken: bool,
        /// Reuse recent results from the validation cache
        #[arg(long)]
        cache: bool,
    },
    /// Clean up and reorganize a playlist
    Organize {
        input: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Additional playlists to append before organizing
        #[arg(long = "merge")]
        merge: Vec<PathBuf>,
        #[arg(long)]
        dedupe: bool,
        /// Fold same-named channels into one entry with backup URLs
        #[arg(long)]
        merge_backups: bool,
        #[arg(long, value_enum)]
        sort: Option<SortKey>,
        #[arg(long)]
        renumber: bool,
        /// FROM=TO, may be repeated
        #[arg(long = "rename-group", value_parser = parse_rename)]
        rename_group: Vec<(String, String)>,
        #[arg(long, requires = "replace")]
        find: Option<String>,
        #[arg(long, requires = "find")]
        replace: Option<String>,
        /// Print channels matching a fuzzy query instead of writing
        #[arg(long)]
        search: Option<String>,
        /// Print the groups with channel counts
        #[arg(long)]
        groups: bool,
    },
    /// Load an XMLTV guide (file or URL)
    Epg {
        source: String,
        /// Fill missing tvg-ids in this playlist from the guide
        #[arg(long, requires = "output")]
        playlist: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Show now/next for one channel id
        #[arg(long)]
        channel: Option<String>,
    },
    /// Serve /now.json, /schedules.json and /epg.json
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// XMLTV file for /epg.json
        #[arg(long)]
        epg: Option<PathBuf>,
    },
    /// Manage the programming schedule database
    Schedule {
        /// Database file (overrides config)
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    AddChannel {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    AddShow {
        title: String,
        /// Minutes
        #[arg(long)]
        duration: i64,
        #[arg(long)]
        genre: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Turn every channel of a playlist into a show
    ImportShows {
        playlist: PathBuf,
        #[arg(long, default_value_t = 30)]
        duration: i64,
    },
    ListShows,
    /// Remove a channel with its schedules and slots
    DeleteChannel {
        name: String,
    },
    /// Remove a show and every slot airing it
    DeleteShow {
        show_id: i64,
    },
    /// Create a schedule window, times as "YYYY-MM-DD HH:MM" in the configured timezone
    Create {
        name: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Fill a schedule with shows
    Autofill {
        schedule_id: i64,
        #[arg(long, value_enum, default_value_t = FillStrategy::RoundRobin)]
        strategy: FillStrategy,
        #[arg(long)]
        seed: Option<u64>,
    },
    Slots {
        schedule_id: i64,
    },
    /// Move a slot to a new start, keeping its length
    MoveSlot {
        slot_id: i64,
        #[arg(long)]
        start: String,
    },
    DeleteSlot {
        slot_id: i64,
    },
    /// Remove a schedule and its slots
    DeleteSchedule {
        schedule_id: i64,
    },
    /// Truncate overlapping slots
    Resolve {
        schedule_id: i64,
    },
    Export {
        schedule_id: i64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_rename(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
        .filter(|(a, _)| !a.is_empty())
        .ok_or_else(|| format!("expected FROM=TO, got '{}'", s))
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "m3u_matrix=debug,m3u_matrix_lib=debug"
    } else {
        "m3u_matrix=info,m3u_matrix_lib=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        if let Some(err) = e.downcast_ref::<MatrixError>() {
            eprintln!("{:#}\n\n{}", e, err.diagnostics());
            std::process::exit(1);
        }
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "config unreadable, using defaults");
            AppConfig::default()
        }),
    };

    // -- HEADLESS MODE --
    if args.headless {
        return run_server(&config, None, None, None).await;
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Parse { input, output, list } => {
            let playlist = load_playlist(&input, &config).await?;
            remember(&mut config, &input, args.config.is_none());
            println!(
                "{} channels in {} groups ({} unrecognized lines)",
                playlist.channels.len(),
                organize::group_names(&playlist.channels).len(),
                playlist.skipped_lines
            );
            if let Some(epg) = &playlist.epg_url {
                println!("EPG: {}", epg);
            }
            if list {
                for ch in &playlist.channels {
                    println!("{:>4}  {:<40} [{}] {}", ch.num, ch.name, ch.group, ch.url);
                }
            }
            if let Some(out) = output {
                parser::write_playlist_file(&out, &playlist.channels, playlist.epg_url.as_deref())?;
                println!("Saved {}", out.display());
            }
        }
        Command::Validate {
            input,
            output,
            workers,
            sequential,
            timeout,
            promote_backups,
            remove_broken,
            cache,
        } => {
            let mut playlist = load_playlist(&input, &config).await?;
            let mut settings = config.validator.clone();
            if let Some(w) = workers {
                settings.workers = w;
            }
            if let Some(t) = timeout {
                settings.timeout_secs = t;
            }
            if sequential {
                settings.workers = 1;
            }

            let use_cache = cache || settings.use_cache;
            let cache_store = use_cache.then(|| Arc::new(Mutex::new(ValidationCache::load())));
            let mut validator = ChannelValidator::new(&settings)?;
            if let Some(c) = &cache_store {
                validator = validator.with_cache(c.clone());
            }

            let cancel = CancelFlag::new();
            let ctrl_c_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling after in-flight checks finish...");
                    ctrl_c_flag.cancel();
                }
            });

            let (tx, mut rx) = mpsc::channel::<ValidationEvent>(64);
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        ValidationEvent::Checked { name, result, .. } => {
                            let detail = result.error.unwrap_or_default();
                            println!("[{:<9}] {} {}", result.status.as_str(), name, detail);
                            if let Some(stage) = result.stage {
                                println!("            {}: {}", stage, stage.suggestion());
                            }
                        }
                        ValidationEvent::Progress(p) => {
                            tracing::debug!("{}", p.to_message());
                        }
                        ValidationEvent::Finished { cancelled } => {
                            if cancelled {
                                println!("Validation cancelled");
                            }
                        }
                    }
                }
            });

            let report = validator
                .validate_channels(&playlist.channels, validator.default_mode(), &cancel, Some(tx))
                .await;
            let _ = printer.await;
            report.apply(&mut playlist.channels);

            if promote_backups {
                let fixed = validator.promote_working_backups(&mut playlist.channels).await;
                println!("Promoted {} backup URL(s)", fixed);
            }

            if let Some(c) = &cache_store {
                if let Err(e) = c.lock().persist(settings.cache_ttl_hours) {
                    tracing::warn!(error = %e, "failed to save validation cache");
                }
            }

            for (status, count) in organize::status_counts(&playlist.channels) {
                println!("{:>9}: {}", status.as_str(), count);
            }

            if remove_broken {
                let removed = organize::remove_by_status(
                    &mut playlist.channels,
                    &[ChannelStatus::Broken, ChannelStatus::Timeout],
                );
                println!("Removed {} dead channel(s)", removed);
            }

            if let Some(out) = output {
                parser::write_playlist_file(&out, &playlist.channels, playlist.epg_url.as_deref())?;
                println!("Saved {}", out.display());
            }
        }
        Command::Organize {
            input,
            output,
            merge,
            dedupe,
            merge_backups,
            sort,
            renumber,
            rename_group,
            find,
            replace,
            search,
            groups,
        } => {
            let mut playlist = load_playlist(&input, &config).await?;
            if !merge.is_empty() {
                let extra = organize::merge_files(&merge)?;
                println!("Merged {} channels from {} file(s)", extra.channels.len(), merge.len());
                playlist.channels.extend(extra.channels);
            }

            if let Some(query) = search {
                for ch in organize::search(&playlist.channels, &query).into_iter().take(50) {
                    println!("{:<40} [{}] {}", ch.name, ch.group, ch.url);
                }
                return Ok(());
            }

            if dedupe {
                println!("Removed {} duplicate URL(s)", organize::dedupe_by_url(&mut playlist.channels));
            }
            if merge_backups {
                println!(
                    "Folded {} duplicate channel(s) into backups",
                    organize::merge_duplicates_as_backups(&mut playlist.channels)
                );
            }
            for (from, to) in &rename_group {
                let n = organize::rename_group(&mut playlist.channels, from, to);
                println!("Renamed group '{}' -> '{}' on {} channel(s)", from, to, n);
            }
            if let (Some(find), Some(replace)) = (&find, &replace) {
                let n = organize::find_replace_names(&mut playlist.channels, find, replace);
                println!("Replaced text in {} name(s)", n);
            }
            if let Some(key) = sort {
                organize::sort_channels(&mut playlist.channels, key);
            }
            if renumber {
                organize::renumber(&mut playlist.channels);
            }

            if groups {
                for group in organize::group_names(&playlist.channels) {
                    let count = organize::filter_by_group(&playlist.channels, &group).len();
                    println!("{:<40} {}", group, count);
                }
            }

            let out = output.unwrap_or_else(|| default_output(&input));
            parser::write_playlist_file(&out, &playlist.channels, playlist.epg_url.as_deref())?;
            println!("Saved {} channels to {}", playlist.channels.len(), out.display());
        }
        Command::Epg {
            source,
            playlist,
            output,
            channel,
        } => {
            let data = load_epg(&source).await?;
            println!(
                "{} channels, {} programmes, {} errors",
                data.channels.len(),
                data.programme_count(),
                data.error_count
            );
            for err in data.errors.iter().take(5) {
                println!("  ! {}", err);
            }

            if let Some(id) = channel {
                let now = Utc::now();
                let tz = config.user_tz();
                let show = |label: &str, p: Option<&epg::Programme>| match p {
                    Some(p) => println!(
                        "{}: {} ({} - {})",
                        label,
                        p.title,
                        p.start.with_timezone(&tz).format("%H:%M"),
                        p.stop.with_timezone(&tz).format("%H:%M")
                    ),
                    None => println!("{}: -", label),
                };
                println!("{}", data.display_name(&id));
                show("Now", data.current_programme(&id, now));
                show("Next", data.next_programme(&id, now));
            }

            if let (Some(pl), Some(out)) = (playlist, output) {
                let mut list = parser::read_playlist_file(&pl)?;
                let matched = data.match_channels(&mut list.channels);
                let epg_url = if source.starts_with("http") {
                    Some(source.as_str())
                } else {
                    list.epg_url.as_deref()
                };
                parser::write_playlist_file(&out, &list.channels, epg_url)?;
                println!("Matched {} channel(s) to EPG ids, saved {}", matched, out.display());
            }
        }
        Command::Serve { bind, port, epg } => {
            run_server(&config, bind, port, epg).await?;
        }
        Command::Schedule { db, action } => {
            let db_path = db.unwrap_or_else(|| config.database_path());
            let store = ScheduleStore::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?;
            run_schedule(&store, action, &config)?;
        }
    }

    Ok(())
}

fn run_schedule(store: &ScheduleStore, action: ScheduleAction, config: &AppConfig) -> Result<(), anyhow::Error> {
    let tz = config.user_tz();
    let local = |t: NaiveDateTime| Utc.from_utc_datetime(&t).with_timezone(&tz).format("%Y-%m-%d %H:%M");

    match action {
        ScheduleAction::AddChannel { name, description } => {
            let id = store.add_channel(&name, description.as_deref())?;
            println!("Channel {} -> id {}", name, id);
        }
        ScheduleAction::AddShow {
            title,
            duration,
            genre,
            url,
        } => {
            let id = store.add_show(&NewShow {
                genre,
                url,
                ..NewShow::new(title, duration)
            })?;
            println!("Show id {}", id);
        }
        ScheduleAction::ImportShows { playlist, duration } => {
            let list = parser::read_playlist_file(&playlist)?;
            let added = store.import_shows(&list.channels, duration)?;
            println!("Imported {} show(s)", added);
        }
        ScheduleAction::ListShows => {
            for show in store.list_shows()? {
                println!(
                    "{:>5}  {:<40} {:>4} min  {}",
                    show.id,
                    show.title,
                    show.duration_minutes,
                    show.genre.unwrap_or_default()
                );
            }
        }
        ScheduleAction::DeleteChannel { name } => {
            let channel_id = store
                .find_channel(&name)?
                .ok_or_else(|| anyhow!("no channel named '{}'", name))?;
            store.delete_channel(channel_id)?;
            println!("Deleted channel {}", name);
        }
        ScheduleAction::DeleteShow { show_id } => {
            store.delete_show(show_id)?;
            println!("Deleted show {}", show_id);
        }
        ScheduleAction::Create {
            name,
            channel,
            start,
            end,
        } => {
            let channel_id = store
                .find_channel(&channel)?
                .ok_or_else(|| anyhow!("no channel named '{}', add it first", channel))?;
            let start = parse_local_time(&start, &tz)?;
            let end = parse_local_time(&end, &tz)?;
            let id = store.create_schedule(&name, channel_id, start, end)?;
            println!("Schedule id {}", id);
        }
        ScheduleAction::Autofill {
            schedule_id,
            strategy,
            seed,
        } => {
            let mut scheduler = match seed {
                Some(seed) => AutoScheduler::with_seed(strategy, seed),
                None => AutoScheduler::new(strategy),
            };
            let report = scheduler.fill_schedule(store, schedule_id, None)?;
            println!(
                "Created {} of {} planned slot(s), {} skipped for conflicts",
                report.created, report.planned, report.skipped_conflicts
            );
        }
        ScheduleAction::Slots { schedule_id } => {
            for slot in store.slots_for_schedule(schedule_id)? {
                println!(
                    "{:>5}  {}  {}  {}",
                    slot.id,
                    local(slot.start),
                    local(slot.end),
                    slot.show_title
                );
            }
        }
        ScheduleAction::MoveSlot { slot_id, start } => {
            store.move_slot(slot_id, parse_local_time(&start, &tz)?)?;
            let slot = store.get_slot(slot_id)?;
            println!("Slot {} now {} - {}", slot_id, local(slot.start), local(slot.end));
        }
        ScheduleAction::DeleteSlot { slot_id } => {
            store.delete_slot(slot_id)?;
            println!("Deleted slot {}", slot_id);
        }
        ScheduleAction::DeleteSchedule { schedule_id } => {
            store.delete_schedule(schedule_id)?;
            println!("Deleted schedule {}", schedule_id);
        }
        ScheduleAction::Resolve { schedule_id } => {
            let outcome = store.resolve_conflicts(schedule_id)?;
            println!("Truncated {}, removed {}", outcome.truncated, outcome.removed);
        }
        ScheduleAction::Export { schedule_id, output } => {
            let json = store.export_schedule_json(schedule_id)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Saved {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }
    Ok(())
}

async fn run_server(
    config: &AppConfig,
    bind: Option<String>,
    port: Option<u16>,
    epg_path: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let mut settings = config.server.clone();
    if let Some(b) = bind {
        settings.bind = b;
    }
    if let Some(p) = port {
        settings.port = p;
    }

    let store = Arc::new(ScheduleStore::open(&config.database_path())?);
    let epg = match epg_path.or_else(|| config.epg_path.clone()) {
        Some(path) => epg::parse_file(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "EPG not loaded");
            EpgData::new()
        }),
        None => EpgData::new(),
    };

    let state = ServerState::new(store, epg);
    server::serve(&settings.address(), state).await?;
    Ok(())
}

fn http_client(config: &AppConfig) -> Result<reqwest::Client, anyhow::Error> {
    Ok(reqwest::Client::builder()
        .user_agent(config.validator.user_agent.clone())
        .timeout(std::time::Duration::from_secs(60))
        .build()?)
}

async fn load_playlist(input: &str, config: &AppConfig) -> Result<Playlist, anyhow::Error> {
    if input.starts_with("http://") || input.starts_with("https://") {
        Ok(parser::fetch_playlist(&http_client(config)?, input).await?)
    } else {
        Ok(parser::read_playlist_file(Path::new(input))
            .with_context(|| format!("reading {}", input))?)
    }
}

async fn load_epg(source: &str) -> Result<EpgData, anyhow::Error> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(epg::fetch_epg(&client, source).await?)
    } else {
        Ok(epg::parse_file(Path::new(source)).with_context(|| format!("reading {}", source))?)
    }
}

fn default_output(input: &str) -> PathBuf {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("playlist");
    PathBuf::from(format!("{}_organized.m3u", organize::sanitize_filename(stem)))
}

fn remember(config: &mut AppConfig, input: &str, persist: bool) {
    if input.starts_with("http") {
        return;
    }
    let path = std::fs::canonicalize(input).unwrap_or_else(|_| PathBuf::from(input));
    config.add_recent_file(path);
    if persist {
        if let Err(e) = config.save() {
            tracing::debug!(error = %e, "could not save recent files");
        }
    }
}

fn parse_local_time(value: &str, tz: &chrono_tz::Tz) -> Result<NaiveDateTime, anyhow::Error> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M")
        .with_context(|| format!("expected YYYY-MM-DD HH:MM, got '{}'", value))?;
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("{} does not exist in {}", value, tz))?;
    Ok(local.with_timezone(&Utc).naive_utc())
}
