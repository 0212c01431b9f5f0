use clap::ValueEnum;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    Layer as _, fmt::MakeWriter, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

/// Build and install the tracing subscriber.
///
/// The default filter follows `-v`; `QIK_LOG` overrides it entirely.
pub fn init_logger<W>(writer: W, verbosity: u8, color: WhenColor) -> Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let default_directive = match verbosity {
        0 => "warn",
        1 => "qik=info",
        _ => "qik=debug",
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("QIK_LOG")
        .with_default_directive(default_directive.parse()?)
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_writer(writer);
    let layer = match color {
        WhenColor::Always => layer.with_ansi(true),
        WhenColor::Never => layer.with_ansi(false),
        WhenColor::Auto => layer.with_ansi(console::Term::stderr().is_term()),
    };

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(layer.with_filter(filter))
        .init();
    Ok(())
}
