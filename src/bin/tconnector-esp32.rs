//! Board bring-up for the ESP32 T-connector node.
//!
//! Wires the three controllers (TWAI on GPIO32/34, two MCP2515s on SPI2
//! behind one arbiter), constructs the [`System`] value, and pins the
//! workers: rx workers run on core 0's executor, close to the hardware;
//! tx workers, the guest host, the mode supervisor and the reporter run on
//! core 1's.
//!
//! The guest binary is embedded at build time; point `TCONNECTOR_GUEST_WASM`
//! at the compiled module before building.

#![no_std]
#![no_main]

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::{Config as SpiConfig, ConfigError as SpiConfigError, Spi};
use esp_hal::spi::Mode as SpiMode;
use esp_hal::system::{CpuControl, Stack};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::twai::{BaudRate, TwaiConfiguration, TwaiMode};
use esp_hal::Blocking;
use esp_hal_embassy::Executor;
use static_cell::StaticCell;

use tconnector::arbiter::SpiArbiter;
use tconnector::codec::SingleFrameCodec;
use tconnector::controller::mcp2515::{Mcp2515, SharedMcp2515};
use tconnector::controller::twai::{TwaiRxLink, TwaiTxLink};
use tconnector::controller::ControllerConfig;
use tconnector::guest::wasmi::WasmiRuntime;
use tconnector::guest::{GuestHost, HostEnv};
use tconnector::mode::{ModeCell, ModeSupervisor};
use tconnector::queue::{RxQueue, TxQueue};
use tconnector::rx::RxWorker;
use tconnector::stats::{ControllerCounters, GuestStats, Heartbeat, Reporter};
use tconnector::system::System;
use tconnector::tx::TxWorker;

/// The sandboxed user program.
static GUEST_WASM: &[u8] = include_bytes!(env!("TCONNECTOR_GUEST_WASM"));

/// Heap for the wasmi interpreter; the message plane itself is static.
const HEAP_SIZE: usize = 96 * 1024;

type SpiHost = Spi<'static, Blocking>;
type CsPin = Output<'static>;
type SharedMcp = SharedMcp2515<'static, SpiHost, CsPin>;

static SYSTEM: StaticCell<System> = StaticCell::new();
static ARBITER: StaticCell<SpiArbiter<SpiHost>> = StaticCell::new();
static MCP_C1: StaticCell<Mutex<CriticalSectionRawMutex, Mcp2515<CsPin>>> = StaticCell::new();
static MCP_C2: StaticCell<Mutex<CriticalSectionRawMutex, Mcp2515<CsPin>>> = StaticCell::new();
static APP_CORE_STACK: StaticCell<Stack<8192>> = StaticCell::new();
static APP_CORE_EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    esp_println::logger::init_logger_from_env();
    esp_alloc::heap_allocator!(size: HEAP_SIZE);

    if let Err(error) = bring_up(spawner) {
        log::error!("bring-up failed: {:?}", error);
    }
}

/// An error during board bring-up.
#[derive(Debug)]
enum Error {
    SpiConfig(SpiConfigError),
    AppCore(esp_hal::system::Error),
}

impl From<SpiConfigError> for Error {
    fn from(error: SpiConfigError) -> Self {
        Error::SpiConfig(error)
    }
}

impl From<esp_hal::system::Error> for Error {
    fn from(error: esp_hal::system::Error) -> Self {
        Error::AppCore(error)
    }
}

fn bring_up(spawner: Spawner) -> Result<(), Error> {
    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timg0.timer0);

    let system: &'static System = SYSTEM.init(System::new());

    // Controller 0: on-chip TWAI at 250 kbps, listen-and-send.
    let twai_config = TwaiConfiguration::new(
        peripherals.TWAI0,
        peripherals.GPIO34,
        peripherals.GPIO32,
        BaudRate::B250K,
        TwaiMode::Normal,
    );
    let (twai_rx, twai_tx) = twai_config.start().split();

    // Controllers 1 and 2: MCP2515s sharing SPI2 behind the arbiter.
    let spi_config = SpiConfig::default()
        .with_frequency(Rate::from_mhz(8))
        .with_mode(SpiMode::_0);
    let spi = Spi::new(peripherals.SPI2, spi_config)?
        .with_sck(peripherals.GPIO6)
        .with_mosi(peripherals.GPIO7)
        .with_miso(peripherals.GPIO2);
    let arbiter: &'static _ = ARBITER.init(SpiArbiter::new(spi));

    let cs_c1 = Output::new(peripherals.GPIO16, Level::High, OutputConfig::default());
    let cs_c2 = Output::new(peripherals.GPIO17, Level::High, OutputConfig::default());
    let mcp_c1: &'static _ = MCP_C1.init(Mutex::new(Mcp2515::new(cs_c1)));
    let mcp_c2: &'static _ = MCP_C2.init(Mutex::new(Mcp2515::new(cs_c2)));
    let shared_c1 = SharedMcp2515::new(arbiter, mcp_c1);
    let shared_c2 = SharedMcp2515::new(arbiter, mcp_c2);

    // Mode lines from the supervising host, no internal pulls.
    let pull_none = InputConfig::default().with_pull(Pull::None);
    let mode_msb = Input::new(peripherals.GPIO25, pull_none);
    let mode_lsb = Input::new(peripherals.GPIO26, pull_none);

    let stats = &system.stats;

    // Everything except the rx workers runs on core 1.
    let mut cpu_control = CpuControl::new(peripherals.CPU_CTRL);
    let app_core_stack = APP_CORE_STACK.init(Stack::new());
    let env = system.host_env();
    let app_core = cpu_control
        .start_app_core(app_core_stack, move || {
            let executor = APP_CORE_EXECUTOR.init(Executor::new());
            executor.run(|spawner| {
                spawner.must_spawn(twai_tx_task(
                    twai_tx,
                    &system.tx_queues[0],
                    &stats.controllers[0],
                    &stats.heartbeats.tx[0],
                ));
                spawner.must_spawn(mcp_tx_task(
                    shared_c1,
                    1,
                    &system.tx_queues[1],
                    &stats.controllers[1],
                    &stats.heartbeats.tx[1],
                ));
                spawner.must_spawn(mcp_tx_task(
                    shared_c2,
                    2,
                    &system.tx_queues[2],
                    &stats.controllers[2],
                    &stats.heartbeats.tx[2],
                ));
                spawner.must_spawn(guest_task(
                    env,
                    &system.rx_queue,
                    &system.mode,
                    &stats.guest,
                    &stats.heartbeats.guest,
                ));
                spawner.must_spawn(mode_task(
                    mode_msb,
                    mode_lsb,
                    &system.mode,
                    &stats.heartbeats.mode,
                ));
                spawner.must_spawn(report_task(system));
            })
        })?;
    // The guard would reset core 1 on drop; the workers run for the life of
    // the device.
    core::mem::forget(app_core);

    // Rx workers stay on this core's executor.
    spawner.must_spawn(twai_rx_task(
        twai_rx,
        &system.rx_queue,
        &stats.controllers[0],
        &stats.heartbeats.rx[0],
    ));
    spawner.must_spawn(mcp_rx_task(
        shared_c1,
        1,
        &system.rx_queue,
        &stats.controllers[1],
        &stats.heartbeats.rx[1],
    ));
    spawner.must_spawn(mcp_rx_task(
        shared_c2,
        2,
        &system.rx_queue,
        &stats.controllers[2],
        &stats.heartbeats.rx[2],
    ));

    Ok(())
}

#[embassy_executor::task]
async fn twai_rx_task(
    rx: esp_hal::twai::TwaiRx<'static, Blocking>,
    queue: &'static RxQueue,
    counters: &'static ControllerCounters,
    heartbeat: &'static Heartbeat,
) {
    let worker = RxWorker::new(
        TwaiRxLink::new(rx),
        SingleFrameCodec::new(),
        0,
        ControllerConfig::default(),
        queue,
        counters,
        heartbeat,
    );
    worker.run().await
}

#[embassy_executor::task(pool_size = 2)]
async fn mcp_rx_task(
    shared: SharedMcp,
    controller_id: u8,
    queue: &'static RxQueue,
    counters: &'static ControllerCounters,
    heartbeat: &'static Heartbeat,
) {
    let worker = RxWorker::new(
        shared.rx(),
        SingleFrameCodec::new(),
        controller_id,
        ControllerConfig::default(),
        queue,
        counters,
        heartbeat,
    );
    worker.run().await
}

#[embassy_executor::task]
async fn twai_tx_task(
    tx: esp_hal::twai::TwaiTx<'static, Blocking>,
    queue: &'static TxQueue,
    counters: &'static ControllerCounters,
    heartbeat: &'static Heartbeat,
) {
    let worker = TxWorker::new(
        TwaiTxLink::new(tx),
        SingleFrameCodec::new(),
        0,
        queue,
        counters,
        heartbeat,
    );
    worker.run().await
}

#[embassy_executor::task(pool_size = 2)]
async fn mcp_tx_task(
    shared: SharedMcp,
    controller_id: u8,
    queue: &'static TxQueue,
    counters: &'static ControllerCounters,
    heartbeat: &'static Heartbeat,
) {
    let worker = TxWorker::new(
        shared.tx(),
        SingleFrameCodec::new(),
        controller_id,
        queue,
        counters,
        heartbeat,
    );
    worker.run().await
}

#[embassy_executor::task]
async fn guest_task(
    env: HostEnv,
    rx_queue: &'static RxQueue,
    mode: &'static ModeCell,
    stats: &'static GuestStats,
    heartbeat: &'static Heartbeat,
) {
    let mut runtime = WasmiRuntime::new();
    match GuestHost::start(&mut runtime, GUEST_WASM, env, rx_queue, mode, stats, heartbeat) {
        Ok(host) => host.run().await,
        // Fatal, but local: the rx/tx workers keep the bus plumbing alive.
        Err(err) => log::error!("guest worker exiting: {:?}", err),
    }
}

#[embassy_executor::task]
async fn mode_task(
    msb: Input<'static>,
    lsb: Input<'static>,
    cell: &'static ModeCell,
    heartbeat: &'static Heartbeat,
) {
    ModeSupervisor::new(msb, lsb, cell, heartbeat).run().await
}

#[embassy_executor::task]
async fn report_task(system: &'static System) {
    Reporter::new(
        &system.stats,
        &system.rx_queue,
        &system.tx_queues,
        &system.mode,
    )
    .run()
    .await
}
