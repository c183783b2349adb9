pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod ffmpeg;
pub mod init;
pub mod materialize;
pub mod phases;
pub mod scenario;
pub mod status;

pub(crate) fn logv(tag: &str, message: &str) {
    eprintln!("[{}] {}", tag, message);
}

pub(crate) fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}
