use clap::Parser;
use connview::flow::export;
use connview::flow::view::{Column, SortDirection, ViewOptions};
use connview::remote::Backend;
use connview::trace::{Command, Snapshot, Update};
use connview::{TraceEvent, TraceHandle, Tracer};
use connview_tools::{init_logging, ConnOpts};

use std::fs::File;
use std::io::{stdout, BufWriter, Stdout, Write};
use std::time::Duration;

use crossbeam::channel;
use futures::{future::FutureExt, select, StreamExt};
use futures_timer::Delay;

use crossterm::ExecutableCommand;
use crossterm::{
    cursor::*,
    event::{Event, EventStream, KeyCode, KeyEvent, KeyModifiers},
    style::*,
    terminal::*,
};

#[derive(Parser, Debug)]
#[command(
    name = "connview-monitor",
    version,
    about = "Live table of the connections seen by a capture backend"
)]
struct Cli {
    #[command(flatten)]
    conn: ConnOpts,

    /// Capture device to trace (default: the first one listed)
    device: Option<String>,
}

/// An escalation request waiting for the user's answer.
struct Escalation {
    restart: bool,
    answer: channel::Sender<bool>,
}

enum Mode {
    Table,
    EditFilter(String),
    Prompt(Escalation),
}

/// Columns `s` cycles through; `None` is arrival order.
const SORT_CYCLE: [Option<Column>; 7] = [
    None,
    Some(Column::Timestamp),
    Some(Column::Length),
    Some(Column::LayerType),
    Some(Column::SrcIp),
    Some(Column::SrcCountryName),
    Some(Column::DstCountryName),
];

/// Longest wait for an answer. Stays under the session's call deadline so
/// the call that asked can still complete.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(25);

struct Monitor {
    // Dropped before `trace` so escalation requests stop queueing while the
    // tracer thread winds down.
    escalations: channel::Receiver<Escalation>,
    trace: TraceHandle,
    /// Latest state published by the tracer thread.
    snapshot: Option<Snapshot>,
    /// Filter and sort as last requested.
    options: ViewOptions,
    link_open: bool,
    mode: Mode,
    sort_index: usize,
    status: String,
    socket: String,
}

fn time_of(ms: i64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms) {
        Some(t) => t.with_timezone(&chrono::Local).format("%H:%M:%S%.3f").to_string(),
        None => ms.to_string(),
    }
}

fn fit(text: &str, width: usize) -> String {
    let mut out: String = text.chars().take(width).collect();
    let len = out.chars().count();
    out.extend(std::iter::repeat(' ').take(width - len));
    out
}

impl Monitor {
    fn handle_update(&mut self, update: Update) {
        match update {
            Update::Event(event) => self.handle_trace_event(event),
            Update::StartFailed(e) => self.status = format!("Cannot trace: {}", e),
            Update::SettingFailed(e) => self.status = e.to_string(),
            Update::Snapshot(snapshot) => self.snapshot = Some(snapshot),
        }
    }

    fn handle_trace_event(&mut self, event: TraceEvent) {
        match event {
            TraceEvent::Connected { sync_errors, location } => {
                self.link_open = true;
                self.status = match (sync_errors.first(), location) {
                    (Some(e), _) => format!("Connected, {}", e),
                    (None, Err(e)) => format!("Connected, {}", e),
                    (None, Ok(())) => "Connected".to_string(),
                };
            }
            TraceEvent::Disconnected => {
                self.link_open = false;
                self.status = "Backend disconnected, reconnecting".to_string();
            }
            TraceEvent::PollFailed(e) if !e.is_transport() => self.status = e.to_string(),
            _ => {}
        }
    }

    fn apply_view(&mut self, f: impl FnOnce(&mut ViewOptions)) {
        f(&mut self.options);
        self.trace.send(Command::SetView(self.options.clone()));
    }

    fn summarized(&self) -> bool {
        self.snapshot.as_ref().is_some_and(|s| s.settings.summarized)
    }

    fn export(&mut self) {
        let rows = match &self.snapshot {
            Some(snapshot) => snapshot.view.rows.clone(),
            None => Vec::new(),
        };
        let name = format!(
            "connview-{}.csv",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );
        let res = File::create(&name)
            .map_err(|e| e.to_string())
            .and_then(|f| export::write_csv(&mut BufWriter::new(f), &rows).map_err(|e| e.to_string()));
        self.status = match res {
            Ok(n) => format!("Exported {} rows to {}", n, name),
            Err(e) => format!("Export failed: {}", e),
        };
    }

    /// Returns false when the monitor should exit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return false;
        }
        let mode = std::mem::replace(&mut self.mode, Mode::Table);
        self.mode = match mode {
            Mode::Prompt(req) => match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    let _ = req.answer.send(true);
                    Mode::Table
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    let _ = req.answer.send(false);
                    Mode::Table
                }
                _ => Mode::Prompt(req),
            },
            Mode::EditFilter(mut text) => match key.code {
                KeyCode::Enter => {
                    self.apply_view(|o| o.filter = text);
                    Mode::Table
                }
                KeyCode::Esc => Mode::Table,
                KeyCode::Backspace => {
                    text.pop();
                    Mode::EditFilter(text)
                }
                KeyCode::Char(c) => {
                    text.push(c);
                    Mode::EditFilter(text)
                }
                _ => Mode::EditFilter(text),
            },
            Mode::Table => match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return false,
                KeyCode::Char('/') => Mode::EditFilter(self.options.filter.clone()),
                KeyCode::Char('s') => {
                    self.sort_index = (self.sort_index + 1) % SORT_CYCLE.len();
                    let column = SORT_CYCLE[self.sort_index];
                    self.apply_view(|o| o.sort_column = column);
                    Mode::Table
                }
                KeyCode::Char('r') => {
                    self.apply_view(|o| o.direction = o.direction.reversed());
                    Mode::Table
                }
                KeyCode::Char('m') => {
                    self.trace.send(Command::SetSummarized(!self.summarized()));
                    Mode::Table
                }
                KeyCode::Char('e') => {
                    self.export();
                    Mode::Table
                }
                _ => Mode::Table,
            },
        };
        true
    }

    fn check_escalations(&mut self) {
        if let Mode::Prompt(_) = self.mode {
            return;
        }
        if let Ok(req) = self.escalations.try_recv() {
            self.mode = Mode::Prompt(req);
        }
    }

    fn draw(&self, out: &mut Stdout) -> std::io::Result<()> {
        let (width, height) = size()?;
        let (width, height) = (width as usize, height as usize);
        let empty = Snapshot {
            view: Default::default(),
            options: self.options.clone(),
            device: None,
            flow_count: 0,
            settings: Default::default(),
        };
        let snapshot = self.snapshot.as_ref().unwrap_or(&empty);
        let view = &snapshot.view;
        let options = &snapshot.options;

        out.execute(MoveTo(0, 0))?;
        let link = if self.link_open { "connected" } else { "offline" };
        let device = snapshot
            .device
            .as_ref()
            .map(|d| d.pcap_name.as_str())
            .unwrap_or("-");
        let sort = match options.sort_column {
            Some(c) => format!(
                "{} {}",
                c,
                if options.direction == SortDirection::Descending { "desc" } else { "asc" }
            ),
            None => "arrival".to_string(),
        };
        let title = format!(
            "{} [{}]  device {}  flows {}  packets {}  sort {}{}",
            self.socket,
            link,
            device,
            snapshot.flow_count,
            view.rows.len(),
            sort,
            if options.summarized { "  summarized" } else { "" }
        );
        print!("{}\r\n", fit(&title, width));

        let filter_line = match &self.mode {
            Mode::EditFilter(text) => format!("filter: {}_", text),
            _ if view.bad_filter.is_some() => format!("filter: {} (invalid, showing all)", options.filter),
            _ => format!("filter: {}", options.filter),
        };
        print!("{}\r\n", fit(&filter_line, width));

        let header = if options.summarized {
            format!(
                "{:<12} {:<12} {:>6} {:<6} {:<6} {:>8} {:<39} {:<16} {:<39} {:<16}",
                "first", "last", "count", "layer", "next", "length", "source", "country", "destination", "country"
            )
        } else {
            format!(
                "{:<12} {:<6} {:<6} {:>8} {:<39} {:<16} {:<39} {:<16}",
                "time", "layer", "next", "length", "source", "country", "destination", "country"
            )
        };
        print!("{}\r\n", fit(&header, width));

        let rows_available = height.saturating_sub(4);
        let start = view.rows.len().saturating_sub(rows_available);
        let mut printed = 0;
        for row in &view.rows[start..] {
            let o = &row.observation;
            let line = if options.summarized {
                format!(
                    "{:<12} {:<12} {:>6} {:<6} {:<6} {:>8} {:<39} {:<16} {:<39} {:<16}",
                    time_of(o.timestamp),
                    time_of(row.last_seen),
                    row.count,
                    o.layer_type,
                    o.next_layer_type,
                    o.length,
                    o.src_ip,
                    o.src_country_name,
                    o.dst_ip,
                    o.dst_country_name
                )
            } else {
                format!(
                    "{:<12} {:<6} {:<6} {:>8} {:<39} {:<16} {:<39} {:<16}",
                    time_of(o.timestamp),
                    o.layer_type,
                    o.next_layer_type,
                    o.length,
                    o.src_ip,
                    o.src_country_name,
                    o.dst_ip,
                    o.dst_country_name
                )
            };
            print!("{}\r\n", fit(&line, width));
            printed += 1;
        }
        for _ in printed..rows_available {
            print!("{}\r\n", fit("", width));
        }

        let status = match &self.mode {
            Mode::Prompt(req) => format!(
                "Backend asks to {} elevated capture privileges. Allow? [y/n]",
                if req.restart { "restart with" } else { "acquire" }
            ),
            _ if !self.status.is_empty() => self.status.clone(),
            _ => "/ filter  s sort  r reverse  m summarize  e export  q quit".to_string(),
        };
        print!("{}", fit(&status, width));
        out.flush()
    }
}

async fn run_monitor(cli: Cli) -> Result<(), String> {
    let proxy = cli.conn.connect()?;
    let (esc_sender, esc_receiver) = channel::bounded::<Escalation>(1);
    proxy
        .on_escalation_request(move |restart| {
            let (answer, reply) = channel::bounded(1);
            if esc_sender.try_send(Escalation { restart, answer }).is_err() {
                return false;
            }
            reply.recv_timeout(PROMPT_TIMEOUT).unwrap_or(false)
        })
        .map_err(|e| e.to_string())?;

    let devices = proxy.list_devices().map_err(|e| e.to_string())?;
    let device = match &cli.device {
        Some(name) => devices
            .into_iter()
            .find(|d| &d.pcap_name == name || &d.net_name == name)
            .ok_or_else(|| format!("No such device: {}", name))?,
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| "No capture devices".to_string())?,
    };

    let events = proxy.session().events().clone();
    while events.try_recv().is_ok() {}
    let settings = cli.conn.load_settings().map_err(|e| e.to_string())?;
    let mut tracer = Tracer::new(proxy, settings);
    tracer.watch_session(events);

    let dark_theme = tracer.settings().dark_theme;
    let options = tracer.view_options().clone();

    // Backend calls can ask for escalation while in flight, so they run on
    // the tracer thread and this loop stays free to show the prompt.
    let trace = tracer.spawn();
    trace.send(Command::Resync);
    trace.send(Command::Start(device));

    let mut monitor = Monitor {
        escalations: esc_receiver,
        trace,
        snapshot: None,
        options,
        link_open: true,
        mode: Mode::Table,
        sort_index: 0,
        status: String::new(),
        socket: cli.conn.socket.clone(),
    };

    let mut reader = EventStream::new();
    let mut stdout = stdout();
    set_colors(&mut stdout, dark_theme).map_err(|e| e.to_string())?;

    'drawing: loop {
        let mut delay = Delay::new(Duration::from_millis(50)).fuse();
        let mut event = reader.next().fuse();

        select! {
            _ = delay => {
                while let Ok(update) = monitor.trace.updates().try_recv() {
                    monitor.handle_update(update);
                }
                monitor.check_escalations();
                if let Err(e) = monitor.draw(&mut stdout) {
                    return Err(e.to_string());
                }
            },
            some_event = event => {
                match some_event {
                    Some(Ok(Event::Key(key))) => {
                        if !monitor.handle_key(key) {
                            break 'drawing;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.to_string()),
                    None => break 'drawing,
                }
            }
        }
    }

    if let Mode::Prompt(req) = std::mem::replace(&mut monitor.mode, Mode::Table) {
        let _ = req.answer.send(false);
    }
    monitor.trace.send(Command::Stop);
    Ok(())
}

fn set_colors(stdout: &mut Stdout, dark: bool) -> std::io::Result<()> {
    let (bg, fg) = if dark {
        (Color::Black, Color::White)
    } else {
        (Color::White, Color::Black)
    };
    stdout.execute(SetBackgroundColor(bg))?;
    stdout.execute(SetForegroundColor(fg))?;
    stdout.execute(Clear(ClearType::All))?;
    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    // Log lines would scribble over the table unless asked for.
    if cli.conn.verbose > 0 {
        init_logging(cli.conn.verbose);
    }

    let mut stdout = stdout();
    let setup = (|| -> std::io::Result<()> {
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        stdout.execute(Hide)?;
        Ok(())
    })();
    if let Err(e) = setup {
        eprintln!("Cannot set up terminal: {}", e);
        return std::process::ExitCode::FAILURE;
    }

    let result = async_std::task::block_on(run_monitor(cli));

    let _ = stdout.execute(ResetColor);
    let _ = stdout.execute(LeaveAlternateScreen);
    let _ = stdout.execute(Show);
    let _ = disable_raw_mode();

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
