use anyhow::{anyhow, bail, Context};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uvcbroker::testing::{CollectingCallback, CountingTarget, ScriptedPermissionSource};
use uvcbroker::{
    spawn_event_pump, Broker, BrokerConfig, DeviceIdentity, SessionEvent, SyntheticPipelineFactory,
    TargetId,
};

fn main() -> anyhow::Result<()> {
    uvcbroker::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: uvcbroker-cli <demo|config> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "demo" => cmd_demo(&args),
        "config" => cmd_config(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

struct DemoOptions {
    clients: usize,
    frames: u64,
    deny: bool,
    json: bool,
    config: Option<PathBuf>,
}

fn parse_demo(args: &[String]) -> anyhow::Result<DemoOptions> {
    let mut opts = DemoOptions {
        clients: 2,
        frames: 5,
        deny: false,
        json: false,
        config: None,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--clients" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| anyhow!("--clients needs a value"))?;
                opts.clients = value.parse().context("invalid --clients")?;
            }
            "--frames" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| anyhow!("--frames needs a value"))?;
                opts.frames = value.parse().context("invalid --frames")?;
            }
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| anyhow!("--config needs a path"))?;
                opts.config = Some(PathBuf::from(value));
            }
            "--deny" => opts.deny = true,
            "--json" => opts.json = true,
            other => bail!("Unknown demo option: {}", other),
        }
        i += 1;
    }
    if opts.clients == 0 {
        bail!("--clients must be at least 1");
    }
    Ok(opts)
}

fn cmd_demo(args: &[String]) -> anyhow::Result<()> {
    let opts = parse_demo(args)?;
    let config = match &opts.config {
        Some(path) => BrokerConfig::load_from_file(path)?,
        None => BrokerConfig::load_or_default(),
    };
    config.validate().map_err(|e| anyhow!(e))?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let source = Arc::new(if opts.deny {
        ScriptedPermissionSource::denying(Duration::from_millis(50))
    } else {
        ScriptedPermissionSource::granting(Duration::from_millis(50))
    });
    source.deliver_via(tx);

    let factory = Arc::new(SyntheticPipelineFactory::new(config.pipeline.clone()));
    let broker = Broker::new(config, source.clone(), factory);
    let pump = {
        let _guard = runtime.enter();
        spawn_event_pump(broker.clone(), rx)
    };

    {
        let broker = Arc::downgrade(&broker);
        ctrlc::set_handler(move || {
            log::info!("Interrupted, shutting down");
            if let Some(broker) = broker.upgrade() {
                if let Err(e) = broker.shutdown() {
                    log::error!("Shutdown failed: {}", e);
                }
            }
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let device = DeviceIdentity::new(0x046d, 0x0825, "/dev/bus/usb/001/004").with_name("Synthetic UVC camera");
    let reports: Vec<ClientReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..opts.clients)
            .map(|n| {
                let broker = broker.clone();
                let device = device.clone();
                let frames = opts.frames;
                scope.spawn(move || run_client(&broker, &device, n, frames))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(n, h)| h.join().unwrap_or_else(|_| ClientReport::failed(n, "client thread panicked")))
            .collect()
    });

    let snapshot = broker.snapshot()?;
    broker.shutdown()?;

    // The pump owns a broker handle, so close the channel from the source side.
    source.stop_delivery();
    let handled = runtime.block_on(pump).context("event pump failed")?;

    if opts.json {
        let output = serde_json::json!({
            "clients": reports,
            "sessions_after_run": snapshot,
            "usb_events": handled,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for r in &reports {
            match &r.error {
                None => println!(
                    "client {}: {} frames rendered, {} events received",
                    r.client, r.frames, r.events
                ),
                Some(e) => println!("client {}: failed: {}", r.client, e),
            }
        }
        println!("{} sessions left after run, {} USB events handled", snapshot.len(), handled);
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct ClientReport {
    client: usize,
    frames: u64,
    events: usize,
    error: Option<String>,
}

impl ClientReport {
    fn failed(client: usize, error: impl std::fmt::Display) -> Self {
        Self {
            client,
            frames: 0,
            events: 0,
            error: Some(error.to_string()),
        }
    }
}

fn run_client(broker: &Arc<Broker>, device: &DeviceIdentity, n: usize, frames: u64) -> ClientReport {
    let callback = Arc::new(CollectingCallback::new());
    let target = Arc::new(CountingTarget::default());
    match drive_client(broker, device, n, frames, &callback, &target) {
        Ok(()) => ClientReport {
            client: n,
            frames: target.frames(),
            events: callback.events().len(),
            error: None,
        },
        Err(e) => ClientReport::failed(n, format!("{:#}", e)),
    }
}

fn drive_client(
    broker: &Arc<Broker>,
    device: &DeviceIdentity,
    n: usize,
    frames: u64,
    callback: &Arc<CollectingCallback>,
    target: &Arc<CountingTarget>,
) -> anyhow::Result<()> {
    let client = broker.control_client(callback.clone());
    let key = client.select(device).context("select failed")?;
    client.connect(&key)?;

    // Client 0 drives a recordable surface, which only sees frames while recording.
    let recorder = n == 0;
    let id = TargetId(n as u32 + 1);
    client.add_surface(&key, id, target.clone(), recorder)?;
    if recorder {
        client.start_recording(&key)?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while target.frames() < frames && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    if recorder {
        client.stop_recording(&key)?;
    }
    client.remove_surface(&key, id)?;
    client.release(&key)?;
    log::debug!(
        "client {} saw connected={}",
        n,
        callback.saw(&SessionEvent::Connected)
    );
    client.unbind()?;
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let write = args.iter().any(|a| a == "--write");
    let path = args
        .iter()
        .skip(2)
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(BrokerConfig::default_path);

    if write {
        BrokerConfig::default().save_to_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = BrokerConfig::load_from_file(&path)?;
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration in {}: {}", path.display(), e);
        std::process::exit(1);
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
