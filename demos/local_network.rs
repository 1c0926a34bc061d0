#[macro_use]
extern crate log;
extern crate overlay_dht;
extern crate simplelog;

use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use overlay_dht::{Config, Key, LookupValue, Node};

fn main() -> overlay_dht::Result<()> {
    let logger_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .build();
    if TermLogger::init(
        LevelFilter::Info,
        logger_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        eprintln!("Logger already initialized.");
    }

    let mut nodes = Vec::new();
    for i in 0..20 {
        let node = Node::bind_udp(Config::default(), &format!("127.0.0.1:{}", 8900 + i))?;
        if i > 0 {
            node.bootstrap(&["127.0.0.1:8900".to_string()])?;
        }
        nodes.push(node);
    }

    // kill a few nodes so lookups have to route around them
    for node in nodes.iter().skip(1).step_by(5) {
        node.kill();
    }

    let key = Key::hash(b"hello.wasm");
    let acks = nodes[3].put(key, b"\0asm\x01\0\0\0".to_vec());
    info!("Stored {:?} at {} nodes", key, acks);

    match nodes[17].lookup_value(&key) {
        LookupValue::Found(value) => info!("Found {} bytes", value.len()),
        LookupValue::NotFound(closest) => info!("Not found; closest nodes are {:?}", closest),
    }

    for node in &nodes {
        node.kill();
    }
    Ok(())
}
