//! ESP32 boot sequence and task wiring.

mod mqtt;
mod platform;
mod wifi;

use embassy_net::{Runner, StackResources};
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::timer::timg::TimerGroup;
use esp_radio::wifi::WifiDevice;
use esp_rtos::embassy::Executor;
use node_core::node::{Node, NodeParts};
use static_cell::StaticCell;

use self::mqtt::MqttSession;
use self::platform::{HeapGauge, RtcWatchdog};
use self::wifi::WifiTransport;
use crate::clock::EmbassyClock;
use crate::config::{CREDENTIALS, HEAP_SIZE, NODE_CONFIG, credentials_present};
use crate::sample::{self, ArrivalLog, SAMPLES};
use crate::telemetry::{TelemetryMirror, emit_status};

type FirmwareNode =
    Node<'static, EmbassyClock, WifiTransport, MqttSession, RtcWatchdog, HeapGauge>;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

pub fn start() -> ! {
    let peripherals = esp_hal::init(esp_hal::Config::default());
    esp_alloc::heap_allocator!(size: HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    platform::log_boot_banner();
    if !credentials_present(&CREDENTIALS) {
        defmt::warn!("boot: NODE_WIFI_SSID was not set at build time");
    }

    // Armed before the radio comes up so a wedged init still ends in a reset.
    let watchdog = RtcWatchdog::start(Rtc::new(peripherals.LPWR), NODE_CONFIG.liveness_deadline);

    let radio = match esp_radio::init() {
        Ok(radio) => RADIO.init(radio),
        Err(err) => {
            defmt::error!("boot: radio init failed: {}", defmt::Debug2Format(&err));
            platform::halt()
        }
    };
    let (controller, interfaces) =
        match esp_radio::wifi::new(radio, peripherals.WIFI, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                defmt::error!("boot: wifi init failed: {}", defmt::Debug2Format(&err));
                platform::halt()
            }
        };

    let rng = Rng::new();
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        STACK_RESOURCES.init(StackResources::<3>::new()),
        seed,
    );

    let parts = NodeParts {
        clock: EmbassyClock,
        transport: WifiTransport::new(controller, stack),
        client: MqttSession::new(stack, NODE_CONFIG.endpoint),
        watchdog,
        gauge: HeapGauge,
        mailbox: &SAMPLES,
        credentials: CREDENTIALS,
    };
    let node = match Node::new(NODE_CONFIG, parts) {
        Ok(node) => node,
        Err(err) => {
            defmt::error!("boot: {}", defmt::Display2Format(&err));
            platform::halt()
        }
    };

    let executor = EXECUTOR.init(Executor::new());
    executor.run(move |spawner| {
        spawner.must_spawn(net_task(runner));
        spawner.must_spawn(node_task(node));
    })
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

#[embassy_executor::task]
async fn node_task(mut node: FirmwareNode) -> ! {
    let mut mirror = TelemetryMirror::new();
    let mut arrivals = ArrivalLog::new();
    let mut ready = false;

    node.run(|node, report| {
        if let Some(arrival) = arrivals.observe(&SAMPLES, &report.publish) {
            sample::log_arrival(arrival, report.session_up);
        }
        mirror.drain(node.telemetry());
        if !ready {
            ready = true;
            defmt::info!(
                "boot: ========== READY ========== topic={}",
                node.pipeline().topic()
            );
        }
        if let Some(snapshot) = &report.status {
            emit_status(snapshot);
        }
    })
    .await
}
