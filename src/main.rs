use hashbrown::HashMap;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodenet::{NetConfig, NetResult, NodeOptions, Nodenet};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }
    if args.len() >= 2 && args[1] == "save-demo" {
        if let Err(e) = run_save_demo() {
            eprintln!("save-demo failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    if args.len() >= 2 {
        eprintln!("Unknown command: {}", args[1]);
        print_help();
        std::process::exit(2);
    }

    if let Err(e) = run_demo() {
        eprintln!("demo failed: {e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("nodenet (spreading-activation graph engine)");
    println!("usage:");
    println!("  cargo run");
    println!("  cargo run -- save-demo");
    println!("  cargo run -- --help");
}

// Minimal demo:
// - a sensor feeds a short Pipe chain ending in an actuator
// - each Pipe waits two steps before its gates open, then the signal
//   travels one hop per step
// - the por links between the pipes decay once the modulator is raised,
//   while the gen links that carry the signal stay untouched
fn run_demo() -> NetResult<()> {
    let mut net = Nodenet::new(
        NetConfig {
            name: "demo".into(),
            initial_nodes: 64,
            ..NetConfig::default()
        },
        &[],
    )?;
    let root = net.root_nodespace_uid();

    let mut sensor_params = HashMap::new();
    sensor_params.insert("datasource".to_string(), Value::from("beacon"));
    let sensor = net.create_node(
        "Sensor",
        &root,
        NodeOptions {
            name: Some("beacon"),
            parameters: Some(&sensor_params),
            ..Default::default()
        },
    )?;

    let mut pipe_params = HashMap::new();
    pipe_params.insert("wait".to_string(), Value::from(2));
    let mut pipes = Vec::new();
    for i in 0..4 {
        let name = format!("seg_{i}");
        pipes.push(net.create_node(
            "Pipe",
            &root,
            NodeOptions {
                name: Some(&name),
                parameters: Some(&pipe_params),
                ..Default::default()
            },
        )?);
    }

    let mut actuator_params = HashMap::new();
    actuator_params.insert("datatarget".to_string(), Value::from("motor"));
    let actuator = net.create_node(
        "Actuator",
        &root,
        NodeOptions {
            name: Some("motor"),
            parameters: Some(&actuator_params),
            ..Default::default()
        },
    )?;

    net.create_link(&sensor, "gen", &pipes[0], "gen", 1.0)?;
    for pair in pipes.windows(2) {
        net.create_link(&pair[0], "gen", &pair[1], "gen", 1.0)?;
        net.create_link(&pair[0], "por", &pair[1], "por", 0.8)?;
    }
    net.create_link(&pipes[3], "gen", &actuator, "gen", 1.0)?;

    let mut world = HashMap::new();
    world.insert("beacon".to_string(), 1.0);

    for t in 0..30 {
        // The beacon goes dark halfway through; watch the chain drain.
        if t == 15 {
            world.insert("beacon".to_string(), 0.0);
        }
        // Raise sequence decay once the signal has arrived.
        if t == 10 {
            net.set_modulator("por_ret_decay", 0.2);
        }
        net.set_sensor_and_actuator_values(&world, &HashMap::new());
        net.step()?;

        if t % 3 == 0 {
            let chain: Vec<String> = pipes
                .iter()
                .map(|uid| format!("{:+.2}", net.get_node_activation(uid).unwrap_or(0.0)))
                .collect();
            let motor = net.read_actuators().get("motor").copied().unwrap_or(0.0);
            let por = net
                .get_link_weight(&pipes[0], "por", &pipes[1], "por")
                .unwrap_or(0.0);
            println!(
                "t={t:2} beacon={:.2} chain=[{}] motor={motor:+.2} por01={por:.3}",
                world["beacon"],
                chain.join(" ")
            );
        }
    }
    Ok(())
}

// Builds a small net, saves it, restores it into a fresh engine and checks
// the restored topology against the original.
fn run_save_demo() -> NetResult<()> {
    let dir = std::env::temp_dir().join("nodenet-save-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("demo-net.json");

    let mut net = Nodenet::new(
        NetConfig {
            name: "save-demo".into(),
            initial_nodes: 128,
            ..NetConfig::default()
        },
        &[],
    )?;
    let root = net.root_nodespace_uid();
    let mut uids = Vec::new();
    for _ in 0..16 {
        uids.push(net.create_node("Register", &root, NodeOptions::default())?);
    }
    for pair in uids.windows(2) {
        net.create_link(&pair[0], "gen", &pair[1], "gen", 0.5)?;
    }
    net.set_node_activation(&uids[0], 1.0)?;
    for _ in 0..4 {
        net.step()?;
    }
    net.save(&path)?;
    println!("saved {} nodes to {}", uids.len(), path.display());

    let mut restored = Nodenet::new(NetConfig::default(), &[])?;
    let report = restored.load(&path)?;
    println!(
        "restored {} nodes at step {} (dropped={} recreated={})",
        restored.node_uids().len(),
        restored.current_step(),
        report.dropped.len(),
        report.recreated.len()
    );
    for pair in uids.windows(2) {
        let weight = restored.get_link_weight(&pair[0], "gen", &pair[1], "gen")?;
        println!("  {} -> {} weight {weight:.2}", pair[0], pair[1]);
    }
    Ok(())
}
