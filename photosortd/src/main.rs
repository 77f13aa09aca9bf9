use anyhow::Context;
use photosortd::config::AppConfig;
use photosortd::daemon::DaemonRuntime;
use photosortd::logging::{LogFormat, init_logging};
use tokio::io::BufReader;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Move(Vec<(String, String)>),
    List(String),
    Link(String),
    Login,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let rest: Vec<String> = args.collect();
    match command.as_str() {
        "--help" | "-h" | "help" => Ok(CliMode::Help),
        "move" => {
            if rest.is_empty() || rest.len() % 2 != 0 {
                anyhow::bail!("move expects <from> <to> pairs");
            }
            Ok(CliMode::Move(
                rest.chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect(),
            ))
        }
        "list" => Ok(CliMode::List(single_arg("list", rest)?)),
        "link" => Ok(CliMode::Link(single_arg("link", rest)?)),
        "login" if rest.is_empty() => Ok(CliMode::Login),
        "logout" if rest.is_empty() => Ok(CliMode::Logout),
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

fn single_arg(command: &str, mut rest: Vec<String>) -> anyhow::Result<String> {
    match rest.len() {
        1 => Ok(rest.remove(0)),
        _ => anyhow::bail!("{command} expects exactly one path"),
    }
}

fn print_help() {
    println!("Usage: photosortd <command>");
    println!("  move <from> <to> [<from> <to> ...]   Move files, several at once");
    println!("  list <folder>                        List photos in a folder, newest first");
    println!("  link <path>                          Print a temporary download link");
    println!("  login                                Authorize this device");
    println!("  logout                               Remove the saved session");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }
    init_logging(LogFormat::from_env())?;

    let config = AppConfig::from_env()?;
    let runtime = DaemonRuntime::bootstrap(config)?;
    match mode {
        CliMode::Move(pairs) => {
            let mut failed = 0usize;
            for report in runtime.move_all(&pairs).await {
                match report.outcome {
                    Ok(_) => println!("moved {} -> {}", report.from, report.to),
                    Err(err) => {
                        failed += 1;
                        eprintln!("failed {} -> {}: {err}", report.from, report.to);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} moves failed", pairs.len());
            }
        }
        CliMode::List(folder) => {
            let photos = runtime
                .list_photos(&folder)
                .await
                .with_context(|| format!("failed to list {folder}"))?;
            for photo in photos {
                println!("{}\t{}", photo.upload_date, photo.path);
            }
        }
        CliMode::Link(path) => {
            let link = runtime
                .temporary_link(&path)
                .await
                .with_context(|| format!("failed to get a link for {path}"))?;
            println!("{link}");
        }
        CliMode::Login => {
            let flow = runtime.oauth_flow()?;
            flow.authenticate(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await
                .context("login failed")?;
            println!("logged in");
        }
        CliMode::Logout => runtime.logout(),
        CliMode::Help => {}
    }
    Ok(())
}
