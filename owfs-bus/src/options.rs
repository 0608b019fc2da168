use core::time::Duration;

/// Lifecycle settings shared by the connections of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    pub(crate) reconnect_threshold: u32,
    pub(crate) reconnect_delay: Duration,
    pub(crate) usb_timeout: Duration,
    pub(crate) w1_timeout: Duration,
    pub(crate) usb_scan_interval: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        BusOptions {
            reconnect_threshold: 2,
            reconnect_delay: Duration::from_millis(200),
            usb_timeout: Duration::from_secs(5),
            w1_timeout: Duration::from_secs(1),
            usb_scan_interval: Duration::from_secs(10),
        }
    }
}

impl BusOptions {
    /// Sets how many consecutive reset errors trigger a reconnect.
    pub fn with_reconnect_threshold(mut self, errors: u32) -> Self {
        self.reconnect_threshold = errors.max(1);
        self
    }

    /// Sets the pause after a failed reconnect.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the timeout of each USB transfer.
    pub fn with_usb_timeout(mut self, timeout: Duration) -> Self {
        self.usb_timeout = timeout;
        self
    }

    /// Sets how long a w1 request waits for the kernel.
    pub fn with_w1_timeout(mut self, timeout: Duration) -> Self {
        self.w1_timeout = timeout;
        self
    }

    /// Sets how often the USB monitor looks for new adapters.
    pub fn with_usb_scan_interval(mut self, interval: Duration) -> Self {
        self.usb_scan_interval = interval;
        self
    }

    /// Consecutive reset errors that trigger a reconnect.
    pub fn reconnect_threshold(&self) -> u32 {
        self.reconnect_threshold
    }

    /// Timeout of each USB transfer.
    pub fn usb_timeout(&self) -> Duration {
        self.usb_timeout
    }

    /// How long a w1 request waits for the kernel.
    pub fn w1_timeout(&self) -> Duration {
        self.w1_timeout
    }

    /// How often the USB monitor looks for new adapters.
    pub fn usb_scan_interval(&self) -> Duration {
        self.usb_scan_interval
    }
}
