//! Voltage DNP3 Demo
//!
//! Runs an outstation and a master on localhost and exercises:
//! - Integrity poll into the master's point database
//! - Select-before-operate on a binary output
//! - Unsolicited event reporting
//! - Time synchronization and clearing DEVICE_RESTART
//!
//! Usage: cargo run --bin demo [port]
//! Example: RUST_LOG=debug cargo run --bin demo 20000

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use voltage_dnp3::{
    AnalogOutputCommand, ControlRelayOutputBlock, DatabaseControlHandler, EventClass,
    FilterLevel, MasterConfig, MasterHandle, OutstationConfig, OutstationServer, Point,
    PointType, TransportSettings,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u16>())
        .transpose()?
        .unwrap_or(20000);

    voltage_dnp3::initialize()?;
    println!("🚀 {}", voltage_dnp3::info());
    println!("=============================\n");

    // =========================================================================
    // Part 1: Outstation
    // =========================================================================
    println!("🏭 Part 1: Outstation on 127.0.0.1:{}", port);
    println!("---------------------------------------");

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let server = OutstationServer::from_listener(listener, OutstationConfig::default());
    let points = vec![
        Point::binary_input(0, false),
        Point::binary_input(1, true),
        Point::binary_output(3, false),
        Point::analog_input(0, 230.4),
        Point::analog_input(1, 49.98),
        Point::analog_output(0, 0.0),
        Point::counter(0, 1200),
    ];
    let accept = tokio::spawn(async move { server.accept(points, DatabaseControlHandler).await });

    // =========================================================================
    // Part 2: Master
    // =========================================================================
    let config = MasterConfig::new(TransportSettings::new("127.0.0.1", port))
        .with_filter_level(FilterLevel::Info);
    let master = MasterHandle::open(config).await?;
    let outstation = accept.await??;
    println!("  Session state: {:?}\n", master.state());

    println!("📊 Part 2: Integrity Poll");
    println!("--------------------------");
    let response = master.integrity_poll().await?;
    println!("  IIN: {}", response.iin);
    for point in master.points().snapshot() {
        println!("  {}[{}] = {} ({:?})", point.point_type, point.index, point.value, point.flags);
    }

    // =========================================================================
    // Part 3: Controls
    // =========================================================================
    println!("\n🎛️  Part 3: Controls");
    println!("--------------------");
    master
        .select_and_operate(3, ControlRelayOutputBlock::latch_on())
        .await?;
    println!(
        "  SBO latch-on BO[3]: outstation now {}",
        outstation.points().read(PointType::BinaryOutput, 3)?.value
    );

    master
        .direct_operate(0, AnalogOutputCommand::new(42.5))
        .await?;
    println!(
        "  Direct operate AO[0]: outstation now {}",
        outstation.points().read(PointType::AnalogOutput, 0)?.value
    );

    match master.operate(3, ControlRelayOutputBlock::latch_off()).await {
        Ok(()) => println!("  ⚠️  Operate without select unexpectedly succeeded"),
        Err(e) => println!("  Operate without select refused: {}", e),
    }

    // =========================================================================
    // Part 4: Unsolicited events
    // =========================================================================
    println!("\n📡 Part 4: Unsolicited Events");
    println!("------------------------------");
    master.enable_unsolicited(&EventClass::ALL).await?;
    outstation.update(Point::binary_input(0, true)).await?;
    outstation.update(Point::analog_input(0, 231.0)).await?;
    sleep(Duration::from_millis(200)).await;
    for point_type in [PointType::BinaryInput, PointType::AnalogInput] {
        let point = master.points().read(point_type, 0)?;
        println!("  Master sees {}[0] = {}", point_type, point.value);
    }

    // =========================================================================
    // Part 5: Time and restart
    // =========================================================================
    println!("\n⏱️  Part 5: Time Sync");
    println!("---------------------");
    let delay = master.sync_time().await?;
    println!("  Estimated link delay: {:?}", delay);
    master.clear_restart().await?;
    master.read_class(&[EventClass::Class1]).await?;
    println!("  IIN after clear_restart: {}", master.last_iin());

    master.close().await?;
    outstation.close().await?;
    voltage_dnp3::shutdown();

    println!("\n✅ Demo completed!");
    Ok(())
}
