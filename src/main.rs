//! noteai: command-line client for the handwriting-note service.
//!
//! Usage: noteai <command> [args...]  (run without arguments for the list)

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use noteai::api::ApiClient;
use noteai::config::Config;
use noteai::detail::NoteDetail;
use noteai::library::NoteLibrary;
use noteai::note::{Note, NoteImage};
use noteai::notes_cache::NotesCache;
use noteai::reconciler::{Collaborators, ReconcilerEvent, StopReason};
use noteai::session::SessionStore;

const USAGE: &str = "\
Usage: noteai <command> [args...]

Commands:
  login <email> <password>          Sign in and store the session
  register <name> <email> <password>
  logout                            Sign out and forget cached notes
  whoami                            Show the signed-in member
  health                            Check that the server is reachable
  notes [--refresh] [--search <q>]  List notes (cached unless --refresh)
  show <id>                         Print a note and its recognized text
  watch <id>                        Follow recognition until every page is done
  create <title> <content> [image...]
  delete <id>
  cache-info                        Show the local cache state";

struct App {
    config: Config,
    session: Arc<SessionStore>,
    api: Arc<ApiClient>,
    cache: Arc<Mutex<NotesCache>>,
}

impl App {
    fn load() -> Result<Self> {
        let config = Config::load()?;
        let session = Arc::new(SessionStore::open(SessionStore::default_path()?)?);
        let api = Arc::new(ApiClient::new(&config.api, session.clone())?);
        let cache = NotesCache::new(config.cache_dir()?, &config.cache.namespace, config.cache.ttl_ms)?;

        Ok(Self {
            config,
            session,
            api,
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    fn library(&self) -> NoteLibrary {
        NoteLibrary::new(self.api.clone(), self.cache.clone())
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.api.clone(),
            cache: self.cache.clone(),
            session: self.session.clone(),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.polling.interval_ms)
    }

    fn require_login(&self) -> Result<()> {
        if !self.session.is_logged_in() {
            bail!("Not logged in. Run `noteai login <email> <password>` first");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("noteai=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    if let Err(e) = run(&args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let ctx = App::load().context("Failed to initialize")?;
    let rest = &args[1..];

    match (args[0].as_str(), rest) {
        ("login", [email, password]) => cmd_login(&ctx, email, password).await,
        ("register", [name, email, password]) => cmd_register(&ctx, name, email, password).await,
        ("logout", []) => cmd_logout(&ctx).await,
        ("whoami", []) => cmd_whoami(&ctx).await,
        ("health", []) => cmd_health(&ctx).await,
        ("notes", flags) => cmd_notes(&ctx, flags).await,
        ("show", [id]) => cmd_show(&ctx, id).await,
        ("watch", [id]) => cmd_watch(&ctx, id).await,
        ("create", [title, content, images @ ..]) => cmd_create(&ctx, title, content, images).await,
        ("delete", [id]) => cmd_delete(&ctx, id).await,
        ("cache-info", []) => cmd_cache_info(&ctx),
        _ => bail!("Unrecognized command\n\n{}", USAGE),
    }
}

async fn cmd_login(ctx: &App, email: &str, password: &str) -> Result<()> {
    let creds = ctx.api.login(email, password).await?;
    println!("Logged in (member {})", creds.member_id);
    Ok(())
}

async fn cmd_register(ctx: &App, name: &str, email: &str, password: &str) -> Result<()> {
    ctx.api.register(name, email, password).await?;
    println!("Registered {}. You can log in now.", email);
    Ok(())
}

async fn cmd_logout(ctx: &App) -> Result<()> {
    ctx.api.logout().await?;
    ctx.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    println!("Logged out");
    Ok(())
}

async fn cmd_whoami(ctx: &App) -> Result<()> {
    ctx.require_login()?;
    let me = ctx.api.my_info().await?;
    println!("member {}", me.member_id);
    println!("email  {}", me.email);
    println!("name   {}", me.name.as_deref().unwrap_or("(not set)"));
    Ok(())
}

async fn cmd_health(ctx: &App) -> Result<()> {
    let status = ctx.api.check_health().await;
    match status.error {
        None => println!("{} is up", ctx.api.base_url()),
        Some(error) => bail!("{} is unreachable: {}", ctx.api.base_url(), error),
    }
    Ok(())
}

async fn cmd_notes(ctx: &App, flags: &[String]) -> Result<()> {
    let mut refresh = false;
    let mut query: Option<&str> = None;
    let mut flags = flags.iter();
    while let Some(flag) = flags.next() {
        match flag.as_str() {
            "--refresh" => refresh = true,
            "--search" => {
                query = Some(flags.next().context("--search needs a query")?.as_str());
            }
            other => bail!("Unknown option {}\n\n{}", other, USAGE),
        }
    }

    ctx.require_login()?;
    let library = ctx.library();
    let notes = match query {
        Some(q) => library.search(q, refresh).await?,
        None => library.notes(refresh).await?,
    };

    let stats = library.stats(&notes);
    println!(
        "{} note(s), {} with recognized pages, {} from the last week",
        stats.total, stats.treasured, stats.recent
    );
    if notes.is_empty() {
        match query {
            Some(q) => println!("Nothing matches \"{}\"", q),
            None => println!("No notes yet"),
        }
        return Ok(());
    }

    for note in &notes {
        println!(
            "{:>8}  {}  {:<32}  {}",
            note.note_id,
            note.created_at.format("%Y-%m-%d %H:%M"),
            note.title,
            note.progress()
        );
    }
    Ok(())
}

async fn cmd_show(ctx: &App, id: &str) -> Result<()> {
    ctx.require_login()?;
    let detail = NoteDetail::open(id, ctx.collaborators(), ctx.poll_interval()).await?;
    if let Some(note) = detail.note() {
        print_note(&ctx.api, &note);
    }
    detail.close();
    Ok(())
}

async fn cmd_watch(ctx: &App, id: &str) -> Result<()> {
    ctx.require_login()?;
    let mut detail = NoteDetail::open(id, ctx.collaborators(), ctx.poll_interval()).await?;
    if let Some(note) = detail.note() {
        print_note(&ctx.api, &note);
    }

    if !detail.is_polling() {
        println!("Nothing to wait for ({})", detail.progress());
        detail.close();
        return Ok(());
    }

    loop {
        tokio::select! {
            event = detail.next_event() => match event {
                Some(ReconcilerEvent::PollingStarted) => println!("Waiting for recognition..."),
                Some(ReconcilerEvent::Snapshot { note, tick }) => {
                    println!("[check {}] {}", tick, note.progress());
                }
                Some(ReconcilerEvent::ImagesCompleted { image_ids }) => {
                    let note = detail.note();
                    for image_id in image_ids {
                        let image = note
                            .as_ref()
                            .and_then(|n| n.images.iter().find(|img| img.image_id == image_id));
                        if let Some(image) = image {
                            print_image(&ctx.api, image);
                        }
                    }
                }
                Some(ReconcilerEvent::PollingStopped { reason: StopReason::Unauthorized })
                | Some(ReconcilerEvent::SessionEnded) => {
                    detail.close();
                    bail!("Session expired, please log in again");
                }
                Some(ReconcilerEvent::PollingStopped { reason }) => {
                    println!("Done ({:?})", reason);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped watching");
                break;
            }
        }
    }

    detail.close();
    Ok(())
}

async fn cmd_create(ctx: &App, title: &str, content: &str, images: &[String]) -> Result<()> {
    ctx.require_login()?;
    let images: Vec<PathBuf> = images.iter().map(PathBuf::from).collect();
    let id = ctx.library().create(title, content, &images).await?;
    println!("Created note {}", id);
    if !images.is_empty() {
        println!("Follow recognition with `noteai watch {}`", id);
    }
    Ok(())
}

async fn cmd_delete(ctx: &App, id: &str) -> Result<()> {
    ctx.require_login()?;
    let library = ctx.library();
    let detail = NoteDetail::open(id, ctx.collaborators(), ctx.poll_interval()).await?;
    let title = detail.note().map(|n| n.title).unwrap_or_default();
    detail.delete(&library).await?;
    println!("Deleted \"{}\"", title);
    Ok(())
}

fn cmd_cache_info(ctx: &App) -> Result<()> {
    let info = ctx.cache.lock().unwrap_or_else(|e| e.into_inner()).info();
    if !info.has_cache {
        println!("No cached notes");
        return Ok(());
    }
    println!("notes    {}", info.notes_count);
    println!("age      {}s", info.age.num_seconds());
    println!("expired  {}", info.is_expired);
    Ok(())
}

fn print_note(api: &ApiClient, note: &Note) {
    println!("{}  (#{})", note.title, note.note_id);
    println!("created {}", note.created_at.format("%Y-%m-%d %H:%M"));
    if !note.content.is_empty() {
        println!("\n{}", note.content);
    }
    println!("\n{} image(s), {}", note.images.len(), note.progress());
    for image in &note.images {
        print_image(api, image);
    }
}

fn print_image(api: &ApiClient, image: &NoteImage) {
    match (&image.analysis_result, image.is_done()) {
        (Some(text), true) => println!("  [{}] {}", image.image_id, text),
        (None, true) => println!("  [{}] (recognized, no text)", image.image_id),
        (_, false) => println!("  [{}] pending", image.image_id),
    }
    if let Some(url) = api.image_url(&image.image_url) {
        println!("      {}", url);
    }
}
