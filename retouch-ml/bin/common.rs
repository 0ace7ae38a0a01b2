use clap::Args;
use retouch_ml::{Device, Placement};
use tracing_subscriber::fmt::format::FmtSpan;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .init();
}

#[derive(Args)]
pub struct DeviceArgs {
    /// cpu, cuda[:N] or metal[:N]; picks the first accelerator when omitted.
    #[arg(long)]
    device: Option<Device>,
}

impl DeviceArgs {
    pub fn resolve(&self) -> anyhow::Result<candle_core::Device> {
        let device = self.device.unwrap_or_else(Device::detect);
        tracing::info!(%device, "using device");
        Ok(Placement::resolve(device)?.backend)
    }
}
