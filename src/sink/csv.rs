use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::data::{group_of, region_name, thread_index, RegionIdentity};
use crate::error::SinkError;
use crate::sink::RegionSink;

const HEADER: &str = "thread,event,region,group,file_name,line,elapsed_ns,value\n";

/// CsvSink (internally called sink::csv)
/// This sink writes one row per event, allowing for fine grained analysis.
/// Rows are written by a background thread; `finalize` waits until
/// everything sent so far is on disk. The first write failure stops the
/// writer and is returned by every later call.
///
/// example output
/// ```bash
/// cat /tmp/regions.csv
///
/// thread,event,region,group,file_name,line,elapsed_ns,value
/// 1,begin,app::solver:solve,app,/work/app/src/solver.rs,41,,
/// 1,begin,user:assemble,user,/work/app/src/solver.rs,57,,
/// 1,parameter,iterations,,,,,12
/// 1,end,user:assemble,user,,,18377,
/// 1,end,app::solver:solve,app,,,90112,
/// ```
pub struct CsvSink {
    tx: Mutex<mpsc::Sender<Message>>,
    failure: Arc<Mutex<Option<io::Error>>>,
    recording: AtomicBool,
    // open regions per thread with their start time, innermost last
    started: Mutex<HashMap<u64, Vec<(String, Instant)>>>,
}

enum Message {
    Row(String),
    Flush(mpsc::Sender<io::Result<()>>),
}

impl CsvSink {
    pub fn new<T: AsRef<Path>>(output_file: T) -> io::Result<Self> {
        let file = File::create(output_file)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Writes rows into `writer` instead of a file.
    pub fn from_writer<W: Write + Send + 'static>(mut writer: W) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let failure = Arc::new(Mutex::new(None));
        let writer_failure = failure.clone();
        std::thread::spawn(move || {
            if let Err(e) = write_rows(&mut writer, &rx) {
                // stored before `rx` goes away, so senders always find it
                *writer_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            }
        });
        Self {
            tx: Mutex::new(tx),
            failure,
            recording: AtomicBool::new(true),
            started: Mutex::new(HashMap::new()),
        }
    }

    fn send(&self, row: Row<'_>) -> Result<(), SinkError> {
        self.send_message(Message::Row(format!("{row}\n")))
    }

    fn send_message(&self, msg: Message) -> Result<(), SinkError> {
        self.check_writer()?;
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        tx.send(msg).map_err(|_| self.closed())
    }

    fn check_writer(&self) -> Result<(), SinkError> {
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // the writer is gone: report why, if it said so
    fn closed(&self) -> SinkError {
        self.failure().unwrap_or(SinkError::Closed)
    }

    fn failure(&self) -> Option<SinkError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|e| SinkError::Io(io::Error::new(e.kind(), e.to_string())))
    }

    fn start(&self, region: String) {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread_index())
            .or_default()
            .push((region, Instant::now()));
    }

    // elapsed time of the innermost open region with this name
    fn stop(&self, region: &str) -> Option<u64> {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        let stack = started.get_mut(&thread_index())?;
        let position = stack.iter().rposition(|(name, _)| name == region)?;
        let (_, start) = stack.remove(position);
        Some(start.elapsed().as_nanos() as u64)
    }

    fn marker(&self, event: &'static str, region: &RegionIdentity) -> Result<(), SinkError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.send(Row {
            event,
            region: region.region_name().into(),
            group: region.group(),
            file_name: &region.file,
            line: Some(region.line),
            ..Row::default()
        })
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    fn parameter(&self, name: &str, value: String) -> Result<(), SinkError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.send(Row {
            event: "parameter",
            region: name.into(),
            value: Some(value),
            ..Row::default()
        })
    }
}

impl RegionSink for CsvSink {
    fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.start(region.region_name());
        self.marker("begin", region)
    }

    fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        let region = region_name(module, function);
        let elapsed_ns = self.stop(&region);

        if !self.is_recording() {
            return Ok(());
        }
        self.send(Row {
            event: "end",
            region: region.into(),
            group: group_of(module),
            elapsed_ns,
            ..Row::default()
        })
    }

    fn enable_recording(&self) -> Result<(), SinkError> {
        self.recording.store(true, Ordering::Relaxed);
        self.send(Row {
            event: "enable_recording",
            ..Row::default()
        })
    }

    fn disable_recording(&self) -> Result<(), SinkError> {
        self.send(Row {
            event: "disable_recording",
            ..Row::default()
        })?;
        self.recording.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        self.parameter(name, value.to_string())
    }

    fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError> {
        self.parameter(name, value.to_string())
    }

    fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.parameter(name, value.to_string())
    }

    fn rewind_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.marker("rewind_begin", region)
    }

    fn rewind_end(&self, module: &str, function: &str, rewind: bool) -> Result<(), SinkError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.send(Row {
            event: "rewind_end",
            region: region_name(module, function).into(),
            group: group_of(module),
            value: Some(rewind.to_string()),
            ..Row::default()
        })
    }

    fn oa_region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.marker("oa_begin", region)
    }

    fn oa_region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.send(Row {
            event: "oa_end",
            region: region_name(module, function).into(),
            group: group_of(module),
            ..Row::default()
        })
    }

    fn finalize(&self) -> Result<(), SinkError> {
        let (done_tx, done_rx) = mpsc::channel();
        self.send_message(Message::Flush(done_tx))?;
        done_rx.recv().map_err(|_| self.closed())??;
        Ok(())
    }
}

// runs on the writer thread until the sink is dropped or a write fails
fn write_rows<W: Write>(writer: &mut W, rx: &mpsc::Receiver<Message>) -> io::Result<()> {
    writer.write_all(HEADER.as_bytes())?;
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Row(row) => writer.write_all(row.as_bytes())?,
            Message::Flush(done) => {
                let flushed = writer.flush();
                let failed = flushed
                    .as_ref()
                    .err()
                    .map(|e| io::Error::new(e.kind(), e.to_string()));
                // the caller may have stopped waiting
                let _ = done.send(flushed);
                if let Some(e) = failed {
                    return Err(e);
                }
            }
        }
    }
    writer.flush()
}

#[derive(Debug, Default)]
struct Row<'a> {
    event: &'a str,
    region: Cow<'a, str>,
    group: &'a str,
    file_name: &'a str,
    line: Option<u32>,
    elapsed_ns: Option<u64>,
    value: Option<String>,
}

impl std::fmt::Display for Row<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{}",
            thread_index(),
            self.event,
            escape(&self.region),
            escape(self.group),
            escape(self.file_name),
            self.line.map(|l| l.to_string()).unwrap_or_default(),
            self.elapsed_ns.map(|ns| ns.to_string()).unwrap_or_default(),
            self.value.as_deref().map(escape).unwrap_or_default(),
        )
    }
}

// quote fields that would otherwise split the row
fn escape(field: &str) -> Cow<'_, str> {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n')) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn writes_rows_in_order() {
        let buffer = SharedBuffer::default();
        let sink = CsvSink::from_writer(buffer.clone());
        let region = RegionIdentity::new("app::solver", "solve", "/src/solver.rs", 41);

        sink.region_begin(&region).unwrap();
        sink.parameter_string("mode, fast", "say \"hi\"").unwrap();
        sink.region_end("app::solver", "solve").unwrap();
        sink.finalize().unwrap();

        let lines = buffer.lines();
        assert_eq!(lines[0], HEADER.trim_end());
        assert!(lines[1].ends_with(",begin,app::solver:solve,app,/src/solver.rs,41,,"));
        assert!(lines[2].ends_with(",parameter,\"mode, fast\",,,,,\"say \"\"hi\"\"\""));
        let end: Vec<_> = lines[3].split(',').collect();
        assert_eq!(end[1], "end");
        assert!(end[6].parse::<u64>().is_ok());
    }

    #[test]
    fn disabled_recording_drops_region_rows() {
        let buffer = SharedBuffer::default();
        let sink = CsvSink::from_writer(buffer.clone());
        let region = RegionIdentity::user("quiet", None, 1);

        sink.disable_recording().unwrap();
        sink.region_begin(&region).unwrap();
        sink.region_end("user", "quiet").unwrap();
        sink.enable_recording().unwrap();
        sink.finalize().unwrap();

        let events: Vec<_> = buffer
            .lines()
            .iter()
            .skip(1)
            .map(|line| line.split(',').nth(1).unwrap().to_string())
            .collect();
        assert_eq!(events, vec!["disable_recording", "enable_recording"]);
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failures_are_reported() {
        let sink = CsvSink::from_writer(BrokenWriter);
        // the header write may fail before or after this row is queued
        let _ = sink.region_begin(&RegionIdentity::user("x", None, 1));

        assert!(matches!(sink.finalize(), Err(SinkError::Io(e)) if e.to_string() == "disk full"));
        assert!(matches!(sink.region_end("user", "x"), Err(SinkError::Io(_))));
        assert!(matches!(sink.finalize(), Err(SinkError::Io(_))));
    }

    #[test]
    fn elapsed_time_follows_the_region_name() {
        let buffer = SharedBuffer::default();
        let sink = CsvSink::from_writer(buffer.clone());

        sink.region_begin(&RegionIdentity::new("app", "a", "/src/app.rs", 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sink.region_begin(&RegionIdentity::new("app", "b", "/src/app.rs", 2)).unwrap();
        // `a` is closed while `b`, opened later, is still open
        sink.region_end("app", "a").unwrap();
        sink.region_end("app", "b").unwrap();
        sink.finalize().unwrap();

        let elapsed: HashMap<String, u64> = buffer
            .lines()
            .iter()
            .map(|line| line.split(',').collect::<Vec<_>>())
            .filter(|fields| fields[1] == "end")
            .map(|fields| (fields[2].to_string(), fields[6].parse().unwrap()))
            .collect();
        assert!(elapsed["app:a"] >= 20_000_000);
        assert!(elapsed["app:b"] < elapsed["app:a"]);
    }

    #[test]
    fn rewind_and_online_access_rows() {
        let buffer = SharedBuffer::default();
        let sink = CsvSink::from_writer(buffer.clone());
        let retry = RegionIdentity::user("retry", None, 3);

        sink.rewind_begin(&retry).unwrap();
        sink.rewind_end("user", "retry", true).unwrap();
        sink.oa_region_begin(&RegionIdentity::user("phase", None, 4)).unwrap();
        sink.oa_region_end("user", "phase").unwrap();
        sink.finalize().unwrap();

        let lines = buffer.lines();
        assert!(lines[1].ends_with(",rewind_begin,user:retry,user,None,3,,"));
        assert!(lines[2].ends_with(",rewind_end,user:retry,user,,,,true"));
        assert!(lines[3].ends_with(",oa_begin,user:phase,user,None,4,,"));
        assert!(lines[4].ends_with(",oa_end,user:phase,user,,,,"));
    }

    #[test]
    fn writes_to_file() {
        let path = std::env::temp_dir().join("tracing_regions_csv_sink.csv");
        let sink = CsvSink::new(&path).unwrap();
        sink.region_begin(&RegionIdentity::user("x", None, 1)).unwrap();
        sink.region_end("user", "x").unwrap();
        sink.finalize().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }
}
