use alarm_bus::broker::BrokerLink;
use alarm_bus::pipe::{client::PipeClient, server};
use alarm_bus::{Alarm, Broadcaster, Listener};
use clap::{App, Arg, ArgMatches};
use futures::FutureExt;
use git_version::git_version;
use log::{error, info};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub type DynResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const DEFAULT_PIPE_PATH: &str = "/tmp/alarm_bus/broker";

async fn connect(path: &str) -> DynResult<Arc<PipeClient>> {
    let client = Arc::new(PipeClient::connect(path).await?);
    client.wait_available(Duration::from_secs(2)).await?;
    Ok(client)
}

async fn run_server(path: &str) -> DynResult<()> {
    let shutdown = CancellationToken::new();
    let shutdown_serve = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };
    let mut serve_task = tokio::spawn(server::serve(path.to_string(), shutdown_serve)).fuse();
    info!("Broker serving on {}", path);
    let mut running = true;
    while running {
        tokio::select! {
            res = signal::ctrl_c() => {
                shutdown.cancel();
                if let Err(e) = res {
                    error!("Failed to wait for ctrl-c: {}", e);
                }
            },
            h = (&mut serve_task) => {
                shutdown.cancel();
                if let Ok(Err(e)) = h {
                    error!("Broker failed: {}", e);
                }
                running = false;
            }
        }
    }
    info!("Broker exiting");
    Ok(())
}

async fn run_get(path: &str, name: &str) -> DynResult<()> {
    let client = connect(path).await?;
    let alarm = client.get(name).await?;
    println!("{}", alarm);
    if !alarm.problem_description.is_empty() {
        println!("  problem: {}", alarm.problem_description);
    }
    if !alarm.parameters.is_empty() {
        println!("  parameters: {}", alarm.parameters);
    }
    Ok(())
}

async fn run_raise(path: &str, name: &str, args: &ArgMatches) -> DynResult<()> {
    let client = connect(path).await?;
    let caster = Broadcaster::new(client, name)?;
    {
        let mut alarm = caster.alarm();
        alarm.node_name = format!("alarm_tool_{}", process::id());
        if let Some(desc) = args.value_of("description") {
            alarm.problem_description = desc.to_string();
        }
    }
    match args.value_of("severity") {
        Some(s) => {
            let severity = s.parse::<u8>().map_err(|_| "Invalid severity")?;
            caster.update_severity(severity).await?;
        }
        None => caster.raise().await?,
    }
    Ok(())
}

async fn run_clear(path: &str, name: &str) -> DynResult<()> {
    let client = connect(path).await?;
    let caster = Broadcaster::new(client.clone(), name)?;
    // Keep the rest of the stored state, only clear the flag
    let current = client.get(name).await?;
    *caster.alarm() = current;
    caster.clear().await?;
    Ok(())
}

async fn run_watch(path: &str, name: &str) -> DynResult<()> {
    let client = connect(path).await?;
    let listener = Listener::new(client, name).await?;
    println!("{}", listener.get_cached_alarm());
    listener.add_cb(|alarm: &Alarm| {
        println!("{}", alarm);
        Ok(())
    });
    loop {
        tokio::select! {
            handled = listener.pump_wait() => {
                if handled == 0 {
                    error!("Subscription lost");
                    break;
                }
            },
            _ = signal::ctrl_c() => break
        }
    }
    Ok(())
}

// Generic over the help lifetime so the version string doesn't have to be
// 'static
fn alarm_arg<'help>() -> Arg<'help> {
    Arg::with_name("alarm").required(true).help("Alarm name")
}

fn build_app(version: &str) -> App {
    App::new("Alarm tool")
        .version(version)
        .about("Raise, clear and watch shared alarms")
        .arg(
            Arg::with_name("pipe")
                .long("pipe")
                .takes_value(true)
                .default_value(DEFAULT_PIPE_PATH)
                .help("Socket path of the alarm broker"),
        )
        .subcommand(App::new("serve").about("Run an alarm broker"))
        .subcommand(App::new("get").about("Print the current state").arg(alarm_arg()))
        .subcommand(
            App::new("raise")
                .about("Raise an alarm")
                .arg(alarm_arg())
                .arg(
                    Arg::with_name("severity")
                        .long("severity")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("description")
                        .long("description")
                        .takes_value(true),
                ),
        )
        .subcommand(App::new("clear").about("Clear an alarm").arg(alarm_arg()))
        .subcommand(
            App::new("watch")
                .about("Print every pushed state change")
                .arg(alarm_arg()),
        )
}

#[tokio::main]
async fn main() {
    alarm_bus::logging::init();
    let version = env!("CARGO_PKG_VERSION").to_string() + " " + git_version!(fallback = "unknown");
    let args = build_app(version.as_str()).get_matches();
    let path = args.value_of("pipe").unwrap_or(DEFAULT_PIPE_PATH).to_string();

    let res = match args.subcommand() {
        Some(("serve", _)) => run_server(&path).await,
        Some(("get", sub)) => run_get(&path, sub.value_of("alarm").unwrap()).await,
        Some(("raise", sub)) => run_raise(&path, sub.value_of("alarm").unwrap(), sub).await,
        Some(("clear", sub)) => run_clear(&path, sub.value_of("alarm").unwrap()).await,
        Some(("watch", sub)) => run_watch(&path, sub.value_of("alarm").unwrap()).await,
        _ => {
            error!("No command given, try --help");
            return;
        }
    };
    if let Err(e) = res {
        error!("{}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The version string is built at runtime, so the app must accept a
    // borrowed version
    #[test]
    fn app_accepts_runtime_version() {
        let version = String::from("0.0.0 test");
        let args = build_app(version.as_str())
            .try_get_matches_from(vec![
                "alarm_tool",
                "--pipe",
                "/tmp/test_pipe",
                "raise",
                "motor",
                "--severity",
                "4",
            ])
            .unwrap();
        assert_eq!(args.value_of("pipe"), Some("/tmp/test_pipe"));
        let (cmd, sub) = args.subcommand().unwrap();
        assert_eq!(cmd, "raise");
        assert_eq!(sub.value_of("alarm"), Some("motor"));
        assert_eq!(sub.value_of("severity"), Some("4"));
    }
}
