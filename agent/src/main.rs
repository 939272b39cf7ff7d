// Host build by default; `--features esp32` builds the ESP-IDF firmware.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

// Drives its own current-thread runtime once wifi and NVS are up.
#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
