use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset, Style};
use compact_str::CompactString;
use kernel_tracer::{Level, Log, Record, KERNEL_TRACER};
use klocks::Once;

/// 日志最终输出到的地方，由平台提供
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

struct KernelLogImpl {
    console: &'static dyn Console,
}

static LOGGER: Once<KernelLogImpl> = Once::new();

/// 注册日志输出。只有第一次调用生效
pub fn init(console: &'static dyn Console) {
    let logger = LOGGER.call_once(|| KernelLogImpl { console });
    KERNEL_TRACER.logger.call_once(|| logger);
}

impl Log for KernelLogImpl {
    fn log_to_console(&self, record: &Record<'_>) {
        // 先拼成一整行再输出，避免多个处理器的日志交错
        let mut line = CompactString::default();
        if write_log(&mut line, record).is_ok() {
            self.console.write_str(&line);
        }
    }
}

fn write_log(writer: &mut impl Write, record: &Record<'_>) -> fmt::Result {
    // 开头部分，即日志级别，如 `[ INFO]`
    let color = match record.level() {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::BrightYellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug => AnsiColor::Green,
        Level::Trace => AnsiColor::BrightBlack,
    };
    write!(
        writer,
        "{}[{:>5}]{}",
        color.render_fg(),
        record.level(),
        Reset.render()
    )?;

    const TARGET_COLOR: Style = AnsiColor::White.on_default().bold();
    write!(
        writer,
        " {}{}{}: ",
        TARGET_COLOR.render(),
        record.target(),
        Reset.render()
    )?;

    writeln!(writer, "{}", record.args())
}
