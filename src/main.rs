use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use chronos_booth::capture::{Camera, Facing, StillFrameSource};
use chronos_booth::config::CONFIG;
use chronos_booth::db::storage::LocalStorage;
use chronos_booth::era::{self, Era};
use chronos_booth::gallery::{write_image_file, Gallery};
use chronos_booth::llm::GeminiClient;
use chronos_booth::session::{CameraFactory, Session};
use chronos_booth::utils::logging::init_logging;
use chronos_booth::workflow::{Event, Notice, Stage};

fn usage() -> &'static str {
    "Usage:\n  \
     chronos-booth eras\n  \
     chronos-booth transform --image <path> (--era <id> | --prompt <text>) [--mirror] [--out <dir>] [--save]\n  \
     chronos-booth gallery list | delete <id> | export <id> [--out <dir>]\n  \
     chronos-booth session [--camera <path>] [--rear]"
}

#[derive(Debug)]
struct TransformArgs {
    image: PathBuf,
    era: Option<&'static Era>,
    prompt: Option<String>,
    mirror: bool,
    out_dir: PathBuf,
    save: bool,
}

#[derive(Debug)]
struct SessionArgs {
    camera: Option<PathBuf>,
    facing: Facing,
}

fn option_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing value for {flag}"))
}

fn parse_transform_args(args: &[String]) -> anyhow::Result<TransformArgs> {
    let mut image = None;
    let mut era = None;
    let mut prompt = None;
    let mut mirror = false;
    let mut out_dir = CONFIG.output_dir.clone();
    let mut save = false;

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => image = Some(PathBuf::from(option_value(args, &mut index, "--image")?)),
            "--era" => {
                let id = option_value(args, &mut index, "--era")?;
                era = Some(era::find(id).ok_or_else(|| anyhow!("Unknown era: {id}"))?);
            }
            "--prompt" => prompt = Some(option_value(args, &mut index, "--prompt")?.to_string()),
            "--out" => out_dir = PathBuf::from(option_value(args, &mut index, "--out")?),
            "--mirror" => mirror = true,
            "--save" => save = true,
            other => bail!("Unknown transform argument: {other}\n{}", usage()),
        }
        index += 1;
    }

    let image = image.ok_or_else(|| anyhow!("--image is required"))?;
    if era.is_some() == prompt.is_some() {
        bail!("Pass exactly one of --era or --prompt");
    }
    Ok(TransformArgs {
        image,
        era,
        prompt,
        mirror,
        out_dir,
        save,
    })
}

fn parse_session_args(args: &[String]) -> anyhow::Result<SessionArgs> {
    let mut camera = None;
    let mut facing = Facing::User;
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--camera" => camera = Some(PathBuf::from(option_value(args, &mut index, "--camera")?)),
            "--rear" => facing = Facing::Environment,
            other => bail!("Unknown session argument: {other}\n{}", usage()),
        }
        index += 1;
    }
    Ok(SessionArgs { camera, facing })
}

fn still_camera(path: PathBuf, facing: Facing) -> CameraFactory {
    let quality = CONFIG.jpeg_quality;
    Box::new(move || {
        Camera::acquire(Box::new(StillFrameSource::new(path.clone(), facing)), quality)
    })
}

async fn open_gallery() -> anyhow::Result<Gallery> {
    let storage = LocalStorage::init(&CONFIG.database_url).await?;
    Ok(Gallery::new(storage, CONFIG.gallery_capacity))
}

fn print_notices(notices: &[Notice]) {
    for notice in notices {
        match notice {
            Notice::Info(message) => println!("  {message}"),
            Notice::Warning(message) => println!("  ! {message}"),
            Notice::Error(message) => println!("  x {message}"),
        }
    }
}

fn print_eras() {
    for era in era::all() {
        println!("  {:<12} {}", era.id, era.name);
    }
}

async fn present_result(session: &Session, out_dir: &Path) -> anyhow::Result<()> {
    let workflow = session.workflow();
    let Some(result) = workflow.result() else {
        return Ok(());
    };
    if let Some(image) = &result.image {
        let slug = workflow
            .target()
            .map(|target| target.file_slug())
            .unwrap_or("edit");
        let path = write_image_file(
            out_dir,
            &format!("chronos-booth-{slug}"),
            &image.bytes,
            &image.mime_type,
        )
        .await?;
        println!("Manifestation written to {}", path.display());
    }
    if let Some(text) = &result.text {
        println!("{text}");
    }
    Ok(())
}

async fn render(session: &Session, out_dir: &Path) -> Vec<Notice> {
    let workflow = session.workflow();
    let mut notices = Vec::new();
    match workflow.stage() {
        Stage::Landing => {
            println!("CHRONOS BOOTH. Type `begin` to step in, `gallery` to browse saved portraits.")
        }
        Stage::Capturing => {
            if session.camera_open() {
                println!("Camera ready. `snap` to capture, `upload <path>` to pick a file, `back` to leave.");
            } else {
                println!("`upload <path>` to pick a portrait, `back` to leave.");
            }
        }
        Stage::Analyzing => println!("Analyzing portrait..."),
        Stage::EraSelection => {
            match workflow.analysis() {
                Some(analysis) => println!("Identity locked:\n{analysis}"),
                None => println!("Identity locked (no analysis available)."),
            }
            println!("Choose a destination with `era <id>` or describe one with `prompt <text>`:");
            print_eras();
        }
        Stage::Generating => {
            let label = workflow.target().map(|target| target.label()).unwrap_or("");
            println!("Manifesting in {label}...");
        }
        Stage::Result => {
            if let Err(err) = present_result(session, out_dir).await {
                error!("Failed to present result: {err:#}");
                notices.push(Notice::Error(format!("Could not write the result: {err}")));
            }
            println!("`save` to keep it, `refine <text>` to adjust, `reset` to start over.");
        }
        Stage::Gallery => {
            match session.gallery().list().await {
                Ok(entries) if entries.is_empty() => println!("The gallery is empty."),
                Ok(entries) => {
                    for entry in &entries {
                        println!("  {}  {}", entry.id, entry.date);
                    }
                }
                Err(err) => {
                    error!("Failed to list the gallery: {err}");
                    notices.push(Notice::Error(format!("Could not read the gallery: {err}")));
                }
            }
            println!("`delete <id>`, `export <id>` or `back`.");
        }
    }
    notices
}

enum Input {
    Event(Event),
    Snap,
    Upload(PathBuf),
    Export(String),
    Eras,
    Status,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let require = |what: &str| {
        if rest.is_empty() {
            Err(format!("`{command}` needs {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    let input = match command.to_lowercase().as_str() {
        "begin" | "start" => Input::Event(Event::Begin),
        "snap" => Input::Snap,
        "upload" | "capture" => Input::Upload(PathBuf::from(require("a file path")?)),
        "era" => {
            let id = require("an era id")?;
            let era = era::find(&id).ok_or_else(|| format!("Unknown era `{id}`; try `eras`"))?;
            Input::Event(Event::EraChosen(era))
        }
        "prompt" => Input::Event(Event::CustomPromptSubmitted(require("a prompt")?)),
        "refine" => Input::Event(Event::Refine(require("a prompt")?)),
        "save" => Input::Event(Event::SaveResult),
        "save-source" => Input::Event(Event::SaveSource),
        "reset" => Input::Event(Event::Reset),
        "gallery" => Input::Event(Event::OpenGallery),
        "delete" => Input::Event(Event::DeleteSaved(require("an id")?)),
        "export" => Input::Export(require("an id")?),
        "back" => Input::Event(Event::Back),
        "eras" => Input::Eras,
        "status" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("Unknown command `{other}`; type `help`")),
    };
    Ok(input)
}

fn print_session_help() {
    println!(
        "Commands: begin, snap, upload <path>, era <id>, prompt <text>, refine <text>, save, \
         save-source, reset, gallery, delete <id>, export <id>, back, eras, status, quit"
    );
}

async fn run_session(args: SessionArgs) -> anyhow::Result<()> {
    let client = GeminiClient::from_config(&CONFIG)?;
    let gallery = open_gallery().await?;
    let factory = args.camera.map(|path| still_camera(path, args.facing));
    let (mut session, mut completions) = Session::new(Arc::new(client), gallery, factory);

    print_session_help();
    print_notices(&render(&session, &CONFIG.output_dir).await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let stage_before = session.workflow().stage();
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let notices = match parse_input(&line) {
                    Ok(Input::Quit) => break,
                    Ok(Input::Event(event)) => session.dispatch(event).await,
                    Ok(Input::Snap) => session.snap().await,
                    Ok(Input::Upload(path)) => session.upload(&path).await,
                    Ok(Input::Export(id)) => {
                        match session.gallery().export(&id, &CONFIG.output_dir).await {
                            Ok(path) => vec![Notice::Info(format!("Exported to {}", path.display()))],
                            Err(err) => vec![Notice::Error(err.to_string())],
                        }
                    }
                    Ok(Input::Eras) => {
                        print_eras();
                        Vec::new()
                    }
                    Ok(Input::Status) => {
                        let storage = match session.gallery().health_check().await {
                            Ok(()) => "ok".to_string(),
                            Err(err) => format!("unavailable ({err})"),
                        };
                        let workflow = session.workflow();
                        vec![Notice::Info(format!(
                            "stage={} busy={} camera_open={} storage={}",
                            workflow.stage(),
                            workflow.is_busy(),
                            session.camera_open(),
                            storage
                        ))]
                    }
                    Ok(Input::Help) => {
                        print_session_help();
                        Vec::new()
                    }
                    Err(message) => vec![Notice::Warning(message)],
                };
                print_notices(&notices);
            }
            Some(event) = completions.recv() => {
                let notices = session.dispatch(event).await;
                print_notices(&notices);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session");
                break;
            }
        }
        let stage_after = session.workflow().stage();
        let refreshed_gallery = stage_after == Stage::Gallery;
        if stage_after != stage_before || refreshed_gallery {
            print_notices(&render(&session, &CONFIG.output_dir).await);
        }
    }

    info!("Session closed");
    Ok(())
}

async fn run_transform(args: TransformArgs) -> anyhow::Result<()> {
    let client = GeminiClient::from_config(&CONFIG)?;
    let gallery = open_gallery().await?;
    let factory = args
        .mirror
        .then(|| still_camera(args.image.clone(), Facing::User));
    let (mut session, mut completions) = Session::new(Arc::new(client), gallery, factory);

    let mut notices = session.dispatch(Event::Begin).await;
    notices.extend(if args.mirror {
        session.snap().await
    } else {
        session.upload(&args.image).await
    });
    notices.extend(session.settle(&mut completions).await);
    if session.workflow().stage() != Stage::EraSelection {
        print_notices(&notices);
        bail!("Could not load portrait from {}", args.image.display());
    }

    let event = match (args.era, args.prompt) {
        (Some(era), _) => Event::EraChosen(era),
        (None, Some(prompt)) => Event::CustomPromptSubmitted(prompt),
        (None, None) => bail!("Pass --era or --prompt"),
    };
    notices.extend(session.dispatch(event).await);
    notices.extend(session.settle(&mut completions).await);
    print_notices(&notices);

    if session.workflow().stage() != Stage::Result {
        bail!("Transformation did not produce a result");
    }
    present_result(&session, &args.out_dir).await?;
    if args.save {
        print_notices(&session.dispatch(Event::SaveResult).await);
    }
    Ok(())
}

async fn run_gallery(args: &[String]) -> anyhow::Result<()> {
    let gallery = open_gallery().await?;
    match args.first().map(|value| value.as_str()) {
        Some("list") | None => {
            let entries = gallery.list().await?;
            if entries.is_empty() {
                println!("The gallery is empty.");
            }
            for entry in entries {
                println!("{}  {}", entry.id, entry.date);
            }
        }
        Some("delete") => {
            let id = args.get(1).ok_or_else(|| anyhow!("delete needs an id"))?;
            if gallery.delete(id).await? {
                println!("Deleted {id}");
            } else {
                println!("No saved portrait {id}");
            }
        }
        Some("export") => {
            let id = args.get(1).ok_or_else(|| anyhow!("export needs an id"))?;
            let out_dir = match args.get(2).map(|value| value.as_str()) {
                Some("--out") => PathBuf::from(
                    args.get(3).ok_or_else(|| anyhow!("Missing value for --out"))?,
                ),
                Some(other) => bail!("Unknown gallery argument: {other}"),
                None => CONFIG.output_dir.clone(),
            };
            let path = gallery.export(id, &out_dir).await?;
            println!("Exported to {}", path.display());
        }
        Some(other) => bail!("Unknown gallery command: {other}\n{}", usage()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let rest = args.get(2..).unwrap_or(&[]);
    let outcome = match args.get(1).map(|value| value.as_str()) {
        Some("eras") => {
            print_eras();
            Ok(())
        }
        Some("transform") => match parse_transform_args(rest) {
            Ok(parsed) => run_transform(parsed).await,
            Err(err) => Err(err),
        },
        Some("gallery") => run_gallery(rest).await,
        Some("session") | None => match parse_session_args(rest) {
            Ok(parsed) => run_session(parsed).await,
            Err(err) => Err(err),
        },
        Some("--help" | "-h" | "help") => {
            println!("{}", usage());
            Ok(())
        }
        Some(other) => Err(anyhow!("Unknown command: {other}\n{}", usage())),
    };

    if let Err(err) = &outcome {
        error!("chronos-booth failed: {err:#}");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chronos_booth::capture::Portrait;
    use chronos_booth::error::BoothError;
    use chronos_booth::llm::{GeneratedImage, TransformTarget, TransformationResult, VisionBackend};

    use super::*;

    struct MirrorBackend;

    #[async_trait]
    impl VisionBackend for MirrorBackend {
        fn name(&self) -> &'static str {
            "mirror"
        }

        async fn analyze(&self, _portrait: &Portrait) -> Result<String, BoothError> {
            Ok("square jaw".to_string())
        }

        async fn transform(
            &self,
            portrait: &Portrait,
            _target: &TransformTarget,
            _analysis: Option<&str>,
        ) -> Result<TransformationResult, BoothError> {
            Ok(TransformationResult {
                image: Some(GeneratedImage {
                    bytes: portrait.bytes().to_vec(),
                    mime_type: portrait.mime_type().to_string(),
                }),
                text: None,
            })
        }
    }

    fn portrait() -> Portrait {
        let frame = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 40, 200]));
        Portrait::from_frame(&frame, false, 90).unwrap()
    }

    #[tokio::test]
    async fn unwritable_output_is_reported_not_fatal() {
        let storage = LocalStorage::init("sqlite::memory:").await.unwrap();
        let (mut session, mut completions) =
            Session::new(Arc::new(MirrorBackend), Gallery::new(storage, 12), None);
        session.dispatch(Event::Begin).await;
        session.dispatch(Event::ImageReady(portrait())).await;
        session.settle(&mut completions).await;
        session
            .dispatch(Event::EraChosen(era::find("noir").unwrap()))
            .await;
        session.settle(&mut completions).await;
        assert_eq!(session.workflow().stage(), Stage::Result);

        // a plain file where the output directory should be
        let blocker = std::env::temp_dir().join(format!("chronos-blocker-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let notices = render(&session, &blocker).await;
        std::fs::remove_file(&blocker).ok();
        assert!(matches!(&notices[..], [Notice::Error(message)] if message.contains("Could not write")));

        let notices = session.dispatch(Event::Reset).await;
        assert!(notices.is_empty());
        assert_eq!(session.workflow().stage(), Stage::Landing);
    }

    #[tokio::test]
    async fn gallery_screen_renders_without_errors() {
        let storage = LocalStorage::init("sqlite::memory:").await.unwrap();
        let (mut session, _completions) =
            Session::new(Arc::new(MirrorBackend), Gallery::new(storage, 12), None);
        session.dispatch(Event::OpenGallery).await;
        assert!(render(&session, Path::new("unused")).await.is_empty());
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn transform_args_need_exactly_one_target() {
        assert!(parse_transform_args(&strings(&["--image", "me.jpg"])).is_err());
        assert!(parse_transform_args(&strings(&[
            "--image", "me.jpg", "--era", "noir", "--prompt", "x"
        ]))
        .is_err());

        let parsed =
            parse_transform_args(&strings(&["--image", "me.jpg", "--era", "noir", "--save"]))
                .unwrap();
        assert_eq!(parsed.era.map(|era| era.id), Some("noir"));
        assert!(parsed.save && !parsed.mirror);
    }

    #[test]
    fn unknown_era_is_rejected_early() {
        let err = parse_transform_args(&strings(&["--image", "a.png", "--era", "jurassic"]))
            .unwrap_err();
        assert!(err.to_string().contains("jurassic"));
    }

    #[test]
    fn session_input_maps_to_events() {
        assert!(matches!(parse_input("begin"), Ok(Input::Event(Event::Begin))));
        assert!(matches!(
            parse_input("era Viking"),
            Ok(Input::Event(Event::EraChosen(era))) if era.id == "viking"
        ));
        assert!(matches!(
            parse_input("prompt  as a marble bust "),
            Ok(Input::Event(Event::CustomPromptSubmitted(prompt))) if prompt == "as a marble bust"
        ));
        assert!(matches!(parse_input("upload ./me.png"), Ok(Input::Upload(_))));
        assert!(parse_input("refine").is_err());
        assert!(parse_input("era atlantisx").is_err());
        assert!(parse_input("dance").is_err());
    }
}
