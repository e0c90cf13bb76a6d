use std::{env, io::BufRead, process, thread};

use dragonlab_hotplate::{
    CancelToken, EngineConfig, InitTable, Outcome, PortConfig, Procedure, ProcedureEngine,
    telemetry::{TracingDisplay, TsvLog},
    with_session,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: run_recipe <port> <recipe> <init table> <telemetry log> [handshake log]";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [port, recipe, table, telemetry, rest @ ..] = args.as_slice() else {
        eprintln!("{USAGE}");
        process::exit(2);
    };

    if let Err(err) = run(port, recipe, table, telemetry, rest.first()) {
        error!("{err}");
        process::exit(1);
    }
}

fn run(
    port: &str,
    recipe: &str,
    table: &str,
    telemetry: &str,
    handshake_log: Option<&String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let procedure = Procedure::load(recipe)?;
    let table = InitTable::load(table)?;
    let config = EngineConfig::default();
    // Reject bad recipes before touching the device.
    procedure.validate(config.step_size)?;
    info!(
        instructions = procedure.instructions().len(),
        seconds = procedure.total_duration().to_secs(),
        "Loaded recipe"
    );

    let log = TsvLog::create(telemetry)?;
    let mut engine = ProcedureEngine::new(config, log, TracingDisplay);
    let cancel = CancelToken::new();
    watch_stdin(cancel.clone());

    let outcome = with_session(&PortConfig::new(port), &table, |link, handshake| {
        if let Some(path) = handshake_log {
            if let Err(err) = std::fs::write(path, handshake.to_string()) {
                error!(%err, path = %path, "Could not write handshake log");
            }
        }
        engine.run(link, &procedure, &cancel)
    })?;

    match outcome {
        Outcome::Completed { samples } => info!(samples, "Recipe complete"),
        Outcome::Cancelled {
            instruction,
            samples,
        } => info!(instruction, samples, "Recipe cancelled"),
    }
    Ok(())
}

/// Cancel the run when Enter is pressed. A closed stdin leaves the run alone.
fn watch_stdin(cancel: CancelToken) {
    info!("Press Enter to stop the recipe");
    thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            info!("Stopping after the current operation");
            cancel.cancel();
        }
    });
}
