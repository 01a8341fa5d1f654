use core::time::Duration;

use esp_hal::rtc_cntl::{Rtc, RwdtStage, reset_reason};
use esp_hal::system::Cpu;
use node_core::liveness::Watchdog;
use node_core::status::ResourceGauge;

/// RTC watchdog: resets the chip when the loop stops refreshing liveness.
pub struct RtcWatchdog {
    rtc: Rtc<'static>,
}

impl RtcWatchdog {
    pub fn start(mut rtc: Rtc<'static>, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        rtc.rwdt
            .set_timeout(RwdtStage::Stage0, esp_hal::time::Duration::from_millis(millis));
        rtc.rwdt.enable();
        defmt::info!("boot: watchdog armed timeout={}ms", millis);
        Self { rtc }
    }
}

impl Watchdog for RtcWatchdog {
    fn feed(&mut self) {
        self.rtc.rwdt.feed();
    }
}

/// Free bytes in the `esp-alloc` heap.
pub struct HeapGauge;

impl ResourceGauge for HeapGauge {
    fn free_memory(&self) -> Option<u32> {
        u32::try_from(esp_alloc::HEAP.free()).ok()
    }
}

pub fn log_boot_banner() {
    defmt::info!("boot: ========== BOOT ==========");
    defmt::info!(
        "boot: reset reason {}",
        defmt::Debug2Format(&reset_reason(Cpu::ProCpu))
    );
    defmt::info!("boot: free heap {}", esp_alloc::HEAP.free());
}

/// Parks the CPU until the watchdog resets it.
pub fn halt() -> ! {
    defmt::error!("boot: halted, waiting for watchdog reset");
    loop {
        core::hint::spin_loop();
    }
}
