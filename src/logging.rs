//! Named, hierarchical loggers behind the `log` facade.
//!
//! A [`Formatter`] renders a [`LogEvent`] through a pattern of one-char
//! `%X` items plus `%d{...}` dates. A [`Logger`] owns appenders and
//! falls back to its parent when it has none; [`LoggerRegistry`] hands
//! out loggers by name, and [`install`] wires the whole thing up as the
//! `log` crate's global sink so the runtime's own `info!`/`error!` calls
//! flow through it, stamped with thread and coroutine ids.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter};

use crate::coroutine;

/// One record on its way to the appenders.
pub struct LogEvent<'a> {
    pub time: SystemTime,
    pub file: &'a str,
    pub line: u32,
    pub thread_id: libc::pid_t,
    pub coroutine_id: u32,
    pub level: Level,
    pub logger: &'a str,
    pub message: &'a str,
}

/// what the formatter found wrong with a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// the pattern ends right after a `%`
    DanglingPercent,
    /// `%d` must be followed by `{strftime-format}`
    MissingDateBrace(usize),
    /// a `%d{` ran to the end of the pattern without its `}`
    UnclosedDateFormat(usize),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatternError::DanglingPercent => write!(f, "pattern ends with a dangling '%'"),
            PatternError::MissingDateBrace(pos) => {
                write!(f, "expected '{{' after %d at byte {}", pos)
            }
            PatternError::UnclosedDateFormat(pos) => {
                write!(f, "unclosed date format starting at byte {}", pos)
            }
        }
    }
}

impl std::error::Error for PatternError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Text(String),
    Message,
    LoggerName,
    Level,
    Line,
    Tab,
    Newline,
    File,
    ThreadId,
    CoroutineId,
    Percent,
    Date(String),
}

/// Pattern-driven event renderer.
///
/// Items: `%m` message, `%c` logger name, `%L` level, `%l` line, `%t`
/// tab, `%n` newline, `%f` file, `%T` thread id, `%R` coroutine id,
/// `%%` literal percent, `%d{...}` strftime date. Unknown codes are
/// logged and skipped.
#[derive(Debug)]
pub struct Formatter {
    pattern: String,
    items: Vec<Item>,
}

impl Formatter {
    pub fn new(pattern: &str) -> Result<Formatter, PatternError> {
        enum FsmState {
            Text(usize),
            Percent,
            WaitBrace,
            DateFmt(usize),
        }

        let mut items = Vec::new();
        let mut state = FsmState::Text(0);

        for (i, c) in pattern.char_indices() {
            let next = i + c.len_utf8();
            state = match state {
                FsmState::Text(start) => {
                    if c == '%' {
                        if i > start {
                            items.push(Item::Text(pattern[start..i].to_owned()));
                        }
                        FsmState::Percent
                    } else {
                        FsmState::Text(start)
                    }
                }
                FsmState::Percent => match c {
                    '%' => {
                        items.push(Item::Percent);
                        FsmState::Text(next)
                    }
                    'd' => FsmState::WaitBrace,
                    'm' => {
                        items.push(Item::Message);
                        FsmState::Text(next)
                    }
                    'c' => {
                        items.push(Item::LoggerName);
                        FsmState::Text(next)
                    }
                    'L' => {
                        items.push(Item::Level);
                        FsmState::Text(next)
                    }
                    'l' => {
                        items.push(Item::Line);
                        FsmState::Text(next)
                    }
                    't' => {
                        items.push(Item::Tab);
                        FsmState::Text(next)
                    }
                    'n' => {
                        items.push(Item::Newline);
                        FsmState::Text(next)
                    }
                    'f' => {
                        items.push(Item::File);
                        FsmState::Text(next)
                    }
                    'T' => {
                        items.push(Item::ThreadId);
                        FsmState::Text(next)
                    }
                    'R' => {
                        items.push(Item::CoroutineId);
                        FsmState::Text(next)
                    }
                    other => {
                        warn!(
                            "ignoring unknown log format item %{} in pattern {:?}",
                            other, pattern
                        );
                        FsmState::Text(next)
                    }
                },
                FsmState::WaitBrace => {
                    if c == '{' {
                        FsmState::DateFmt(next)
                    } else {
                        return Err(PatternError::MissingDateBrace(i));
                    }
                }
                FsmState::DateFmt(start) => {
                    if c == '}' {
                        items.push(Item::Date(pattern[start..i].to_owned()));
                        FsmState::Text(next)
                    } else {
                        FsmState::DateFmt(start)
                    }
                }
            };
        }

        match state {
            FsmState::Text(start) => {
                if pattern.len() > start {
                    items.push(Item::Text(pattern[start..].to_owned()));
                }
            }
            FsmState::Percent => return Err(PatternError::DanglingPercent),
            FsmState::WaitBrace => return Err(PatternError::MissingDateBrace(pattern.len())),
            FsmState::DateFmt(start) => return Err(PatternError::UnclosedDateFormat(start)),
        }

        Ok(Formatter {
            pattern: pattern.to_owned(),
            items,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Re-emits the pattern from the parsed items; equals the original
    /// for any pattern this parser accepted in full.
    pub fn emit_pattern(&self) -> String {
        let mut out = String::with_capacity(self.pattern.len());
        for item in &self.items {
            match item {
                Item::Text(t) => out.push_str(t),
                Item::Message => out.push_str("%m"),
                Item::LoggerName => out.push_str("%c"),
                Item::Level => out.push_str("%L"),
                Item::Line => out.push_str("%l"),
                Item::Tab => out.push_str("%t"),
                Item::Newline => out.push_str("%n"),
                Item::File => out.push_str("%f"),
                Item::ThreadId => out.push_str("%T"),
                Item::CoroutineId => out.push_str("%R"),
                Item::Percent => out.push_str("%%"),
                Item::Date(f) => {
                    out.push_str("%d{");
                    out.push_str(f);
                    out.push('}');
                }
            }
        }
        out
    }

    pub fn format(&self, event: &LogEvent) -> String {
        let mut out = String::with_capacity(64 + event.message.len());
        for item in &self.items {
            match item {
                Item::Text(t) => out.push_str(t),
                Item::Message => out.push_str(event.message),
                Item::LoggerName => out.push_str(event.logger),
                Item::Level => out.push_str(event.level.as_str()),
                Item::Line => out.push_str(&event.line.to_string()),
                Item::Tab => out.push('\t'),
                Item::Newline => out.push('\n'),
                Item::File => out.push_str(event.file),
                Item::ThreadId => out.push_str(&event.thread_id.to_string()),
                Item::CoroutineId => out.push_str(&event.coroutine_id.to_string()),
                Item::Percent => out.push('%'),
                Item::Date(f) => out.push_str(&format_time(event.time, f)),
            }
        }
        out
    }
}

// strftime through libc; the pattern language is exactly what the
// platform strftime accepts
fn format_time(t: SystemTime, fmt: &str) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);
    let cfmt = match CString::new(fmt) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    let mut buf = [0u8; 256];
    let n = unsafe {
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&secs, &mut tm);
        libc::strftime(buf.as_mut_ptr() as *mut libc::c_char, buf.len(), cfmt.as_ptr(), &tm)
    };
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

/// Where formatted events end up.
pub trait Appender: Send + Sync {
    fn append(&self, event: &LogEvent);
}

/// Appends to any `Write` sink under a mutex.
pub struct StreamAppender<W: Write + Send> {
    formatter: Formatter,
    target: Mutex<W>,
}

impl<W: Write + Send> StreamAppender<W> {
    pub fn new(target: W, formatter: Formatter) -> Self {
        StreamAppender {
            formatter,
            target: Mutex::new(target),
        }
    }
}

impl<W: Write + Send> Appender for StreamAppender<W> {
    fn append(&self, event: &LogEvent) {
        let line = self.formatter.format(event);
        let mut out = self.target.lock().unwrap();
        let _ = out.write_all(line.as_bytes());
    }
}

/// setting a parent that would close a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicParent;

impl fmt::Display for CyclicParent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "logger parent chain would become cyclic")
    }
}

impl std::error::Error for CyclicParent {}

fn level_to_u8(l: LevelFilter) -> u8 {
    match l {
        LevelFilter::Off => 0,
        LevelFilter::Error => 1,
        LevelFilter::Warn => 2,
        LevelFilter::Info => 3,
        LevelFilter::Debug => 4,
        LevelFilter::Trace => 5,
    }
}

fn u8_to_level(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// A named logger. Events below the logger's level are dropped; a
/// logger without appenders delegates to its parent.
pub struct Logger {
    name: String,
    level: AtomicU8,
    appenders: RwLock<Vec<Arc<dyn Appender>>>,
    parent: RwLock<Option<Arc<Logger>>>,
}

impl Logger {
    fn new(name: String, level: LevelFilter) -> Arc<Logger> {
        Arc::new(Logger {
            name,
            level: AtomicU8::new(level_to_u8(level)),
            appenders: RwLock::new(Vec::new()),
            parent: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> LevelFilter {
        u8_to_level(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level_to_u8(level), Ordering::Relaxed);
    }

    pub fn add_appender(&self, appender: Arc<dyn Appender>) {
        self.appenders.write().unwrap().push(appender);
    }

    pub fn clear_appenders(&self) {
        self.appenders.write().unwrap().clear();
    }

    /// Reparents this logger. Fails with [`CyclicParent`] when `parent`
    /// already reaches `self` through its own chain.
    pub fn set_parent(self: &Arc<Self>, parent: Arc<Logger>) -> Result<(), CyclicParent> {
        let mut walk = Some(parent.clone());
        while let Some(p) = walk {
            if Arc::ptr_eq(&p, self) {
                return Err(CyclicParent);
            }
            walk = p.parent.read().unwrap().clone();
        }
        *self.parent.write().unwrap() = Some(parent);
        Ok(())
    }

    pub fn log(&self, event: &LogEvent) {
        if event.level > self.level() {
            return;
        }
        let appenders = self.appenders.read().unwrap();
        if appenders.is_empty() {
            drop(appenders);
            if let Some(parent) = self.parent.read().unwrap().clone() {
                parent.log(event);
            }
            return;
        }
        for a in appenders.iter() {
            a.append(event);
        }
    }
}

/// default root pattern: date, thread, coroutine, level, logger,
/// file:line, message
pub const DEFAULT_PATTERN: &str = "%d{%Y-%m-%d %H:%M:%S}%t%T%t%R%t[%L]%t[%c]%t%f:%l%t%m%n";

pub const ROOT_LOGGER_NAME: &str = "root";

/// Hands out loggers by name; every new logger starts out parented to
/// the root logger, which carries a stderr appender with
/// [`DEFAULT_PATTERN`].
pub struct LoggerRegistry {
    loggers: Mutex<HashMap<String, Arc<Logger>>>,
    root: Arc<Logger>,
}

impl LoggerRegistry {
    pub fn new() -> LoggerRegistry {
        let root = Logger::new(ROOT_LOGGER_NAME.to_owned(), LevelFilter::Info);
        let formatter = Formatter::new(DEFAULT_PATTERN).expect("default pattern is well-formed");
        root.add_appender(Arc::new(StreamAppender::new(std::io::stderr(), formatter)));
        LoggerRegistry {
            loggers: Mutex::new(HashMap::new()),
            root,
        }
    }

    pub fn root(&self) -> Arc<Logger> {
        self.root.clone()
    }

    pub fn get_logger(&self, name: &str) -> Arc<Logger> {
        if name == ROOT_LOGGER_NAME {
            return self.root.clone();
        }
        let mut loggers = self.loggers.lock().unwrap();
        loggers
            .entry(name.to_owned())
            .or_insert_with(|| {
                let logger = Logger::new(name.to_owned(), LevelFilter::Trace);
                logger
                    .set_parent(self.root.clone())
                    .expect("fresh logger cannot form a cycle");
                logger
            })
            .clone()
    }
}

impl Default for LoggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter that routes `log` facade records into a registry, stamping
/// kernel thread id and current coroutine id.
pub struct LogBridge {
    registry: Arc<LoggerRegistry>,
}

impl LogBridge {
    pub fn new(registry: Arc<LoggerRegistry>) -> Self {
        LogBridge { registry }
    }
}

impl log::Log for LogBridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let message = record.args().to_string();
        let event = LogEvent {
            time: SystemTime::now(),
            file: record.file().unwrap_or("<unknown>"),
            line: record.line().unwrap_or(0),
            thread_id: unsafe { libc::gettid() },
            coroutine_id: coroutine::this_thread::current_id(),
            level: record.level(),
            logger: record.target(),
            message: &message,
        };
        self.registry.get_logger(record.target()).log(&event);
    }

    fn flush(&self) {}
}

/// Installs `registry` as the process-wide `log` sink.
///
/// Fails when another logger was installed first, like any
/// `log::set_boxed_logger` call.
pub fn install(registry: Arc<LoggerRegistry>) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(LogBridge::new(registry)))?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event<'a>(msg: &'a str, logger: &'a str) -> LogEvent<'a> {
        LogEvent {
            time: UNIX_EPOCH,
            file: "demo.rs",
            line: 42,
            thread_id: 7,
            coroutine_id: 3,
            level: Level::Info,
            logger,
            message: msg,
        }
    }

    #[test]
    fn format_items_render() {
        let f = Formatter::new("[%L] %c %f:%l co=%R %m%n").unwrap();
        let out = f.format(&event("hello", "sys"));
        assert_eq!(out, "[INFO] sys demo.rs:42 co=3 hello\n");
    }

    #[test]
    fn double_percent_is_literal() {
        let f = Formatter::new("100%% done").unwrap();
        assert_eq!(f.format(&event("", "x")), "100% done");
    }

    // parse then re-emit equals the original pattern
    #[test]
    fn pattern_round_trip() {
        for pattern in [
            DEFAULT_PATTERN,
            "%m",
            "plain text only",
            "[%L]%t%c - %m%n",
            "%d{%H:%M:%S} %m",
            "100%% %m",
        ] {
            let f = Formatter::new(pattern).unwrap();
            assert_eq!(f.emit_pattern(), pattern, "pattern {:?}", pattern);
        }
    }

    #[test]
    fn malformed_patterns_error() {
        assert!(matches!(
            Formatter::new("oops%").unwrap_err(),
            PatternError::DanglingPercent
        ));
        assert!(matches!(
            Formatter::new("%dYmd").unwrap_err(),
            PatternError::MissingDateBrace(_)
        ));
        assert!(matches!(
            Formatter::new("%d{%Y").unwrap_err(),
            PatternError::UnclosedDateFormat(_)
        ));
    }

    #[test]
    fn parent_fallback_and_cycle_rejection() {
        let reg = LoggerRegistry::new();
        let a = reg.get_logger("a");
        let b = reg.get_logger("b");
        b.set_parent(a.clone()).unwrap();
        assert_eq!(a.set_parent(b.clone()), Err(CyclicParent));

        // b has no appender: events fall through b -> a
        let lines = Arc::new(Mutex::new(Vec::new()));
        struct VecAppender(Arc<Mutex<Vec<String>>>);
        impl Appender for VecAppender {
            fn append(&self, ev: &LogEvent) {
                self.0.lock().unwrap().push(ev.message.to_owned());
            }
        }
        a.add_appender(Arc::new(VecAppender(lines.clone())));
        b.log(&event("through-parent", "b"));
        assert_eq!(&*lines.lock().unwrap(), &["through-parent".to_owned()]);
    }

    #[test]
    fn level_filters_drop_events() {
        let reg = LoggerRegistry::new();
        let l = reg.get_logger("lvl");
        let lines = Arc::new(Mutex::new(Vec::new()));
        struct VecAppender(Arc<Mutex<Vec<String>>>);
        impl Appender for VecAppender {
            fn append(&self, ev: &LogEvent) {
                self.0.lock().unwrap().push(ev.message.to_owned());
            }
        }
        l.add_appender(Arc::new(VecAppender(lines.clone())));
        l.set_level(LevelFilter::Error);
        l.log(&event("dropped", "lvl"));
        l.set_level(LevelFilter::Debug);
        l.log(&event("kept", "lvl"));
        assert_eq!(&*lines.lock().unwrap(), &["kept".to_owned()]);
    }
}
