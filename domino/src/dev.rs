use env_logger::Builder;
use std::io::Write;

/// Install a colored `env_logger` driven by `RUST_LOG`. Calling it more than once is harmless,
/// the first logger stays in place.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{}{:5}{}] {}:{} - {}",
                buf.timestamp_millis(),
                lvl.render(),
                record.level(),
                lvl.render_reset(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Auto);

    let _ = builder.try_init();
}

/// Receive from a channel but give up after `ms` milliseconds.
#[cfg(test)]
pub(crate) async fn recv_timeout<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>, ms: u64) -> Option<T> {
    let sleep = tokio::time::sleep(tokio::time::Duration::from_millis(ms));
    tokio::pin!(sleep);

    tokio::select! {
        value = rx.recv() => {
            value
        }
        _ = &mut sleep => {
            None
        }
    }
}
