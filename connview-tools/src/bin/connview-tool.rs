use clap::{Parser, Subcommand};
use connview::flow::export;
use connview::flow::view::{self, Column, SortDirection, ViewOptions, ViewRow};
use connview::flow::Location;
use connview::remote::Backend;
use connview::settings::{Settings, SettingsStore, SettingsSync};
use connview::{RemoteProxy, TraceEvent, Tracer};
use connview_tools::{init_logging, ConnOpts};

use std::fs::File;
use std::io::{self, prelude::*, BufWriter};
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "connview-tool",
    version,
    about = "Inspect and control a network capture backend"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct ViewArgs {
    /// Case insensitive regular expression matched against each row
    #[arg(short = 'F', long = "filter", default_value = "")]
    filter: String,

    /// Column to sort on (e.g., timestamp, length, srcCountryName)
    #[arg(short = 'o', long = "sort")]
    sort: Option<Column>,

    /// Sort in descending order
    #[arg(long = "desc")]
    desc: bool,

    /// Aggregate rows by flow
    #[arg(short = 'm', long = "summarize")]
    summarize: bool,
}

impl ViewArgs {
    fn options(&self) -> ViewOptions {
        ViewOptions {
            filter: self.filter.clone(),
            sort_column: self.sort,
            direction: if self.desc {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            },
            summarized: self.summarize,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List capture devices
    Devices {
        #[command(flatten)]
        conn: ConnOpts,
    },
    /// Trace a device and report flow changes as they are polled
    Trace {
        #[command(flatten)]
        conn: ConnOpts,

        /// Capture device name (as listed by `devices`)
        device: String,

        /// Stop after this many seconds (default: run until interrupted)
        #[arg(short = 'd', long = "duration")]
        duration: Option<f64>,

        /// Print the packet table when stopping
        #[arg(long = "table")]
        table: bool,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Print the current connections
    Connections {
        #[command(flatten)]
        conn: ConnOpts,
    },
    /// Print the backend's packet cache as a table
    Packets {
        #[command(flatten)]
        conn: ConnOpts,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Export the backend's packet cache to CSV
    Export {
        #[command(flatten)]
        conn: ConnOpts,

        /// Output file (default: standard output)
        #[arg(short = 'f', long = "file")]
        file: Option<String>,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Show or change settings
    Settings {
        #[command(flatten)]
        conn: ConnOpts,

        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Manage the GeoIP database of the backend
    Db {
        #[command(flatten)]
        conn: ConnOpts,

        #[command(subcommand)]
        command: DbCommand,
    },
    /// Restart the backend
    Restart {
        #[command(flatten)]
        conn: ConnOpts,

        /// Ask the backend to acquire capture permissions while restarting
        #[arg(long = "fix-permissions")]
        fix_permissions: bool,
    },
    /// Geolocate an address through the backend
    Lookup {
        #[command(flatten)]
        conn: ConnOpts,

        ip: String,
    },
    /// Have the backend open a link in a browser
    Open {
        #[command(flatten)]
        conn: ConnOpts,

        url: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print settings, reconciled with the backend if it is reachable
    Show,
    /// Change one setting
    Set {
        /// One of: max-packet-cache, max-connections-cache, db-path,
        /// db-download-url, summarized, connections-interval-ms,
        /// packets-interval-ms, dark-theme, local-location, public-address
        key: String,
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Report whether the database needs to be downloaded
    Check,
    /// Download the database
    Download { license_key: String },
    /// Upload a database file
    Upload { file: String },
    /// Delete the database
    Delete,
    /// Show or set the database path
    Path { value: Option<String> },
    /// Show or set the database download URL
    Url { value: Option<String> },
}

fn connect(conn: &ConnOpts) -> Result<RemoteProxy, ()> {
    let proxy = conn.connect().map_err(|e| eprintln!("{}", e))?;
    if let Err(e) = proxy.on_escalation_request(prompt_escalation) {
        tracing::warn!("cannot answer escalation requests: {}", e);
    }
    Ok(proxy)
}

fn prompt_escalation(restart: bool) -> bool {
    let action = if restart { "restart with" } else { "acquire" };
    eprint!("The backend asks to {} elevated capture privileges. Allow? [y/N] ", action);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
}

fn format_time(ms: i64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms) {
        Some(t) => t
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string(),
        None => ms.to_string(),
    }
}

fn print_rows(rows: &[ViewRow], summarized: bool) {
    let mut columns = vec![Column::Timestamp];
    if summarized {
        columns.extend([Column::LastSeen, Column::Count]);
    }
    columns.extend([
        Column::LayerType,
        Column::NextLayerType,
        Column::Length,
        Column::SrcIp,
        Column::SrcCountryName,
        Column::DstIp,
        Column::DstCountryName,
    ]);
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| match c {
                    Column::Timestamp => format_time(row.observation.timestamp),
                    Column::LastSeen => format_time(row.last_seen),
                    _ => row.cell(*c),
                })
                .collect()
        })
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            cells
                .iter()
                .map(|r| r[i].len())
                .chain(std::iter::once(c.name().len()))
                .max()
                .unwrap_or(0)
        })
        .collect();
    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, &w)| format!("{:<w$}", c.name()))
        .collect();
    println!("{}", header.join("  "));
    for row in cells {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{:<w$}", cell))
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}

fn list_devices(conn: &ConnOpts) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let devices = proxy.list_devices().map_err(|e| eprintln!("{}", e))?;
    if devices.is_empty() {
        println!("No capture devices");
    }
    for dev in devices {
        println!("{:<24} {:<20} mtu {}", dev.pcap_name, dev.net_name, dev.mtu);
    }
    Ok(())
}

fn trace(
    conn: &ConnOpts,
    device: String,
    duration: Option<f64>,
    table: bool,
    view: &ViewArgs,
) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let events = proxy.session().events().clone();
    // Settings are reconciled below; the link is already up.
    while events.try_recv().is_ok() {}
    let settings = conn.load_settings().map_err(|e| eprintln!("{}", e))?;

    let devices = proxy.list_devices().map_err(|e| eprintln!("{}", e))?;
    let device = match devices.into_iter().find(|d| d.pcap_name == device || d.net_name == device) {
        Some(dev) => dev,
        None => {
            eprintln!("No such device: {}", device);
            return Err(());
        }
    };

    let mut tracer = Tracer::new(proxy, settings);
    tracer.watch_session(events);
    if let TraceEvent::Connected { sync_errors, .. } = tracer.on_connect() {
        for e in sync_errors {
            tracing::warn!("{}", e);
        }
    }
    tracer.start(device).map_err(|e| eprintln!("{}", e))?;
    if view.summarize != tracer.settings().summarized {
        if let Err(e) = tracer.set_summarized(view.summarize) {
            tracing::warn!("{}", e);
        }
    }

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        match tracer.step(Duration::from_millis(100)) {
            Some(TraceEvent::Connections(delta)) => {
                for id in &delta.added {
                    if let Some(flow) = tracer.registry().flow(id) {
                        println!("+ {} {}", format_time(flow.first_seen), flow.label);
                    }
                }
                for id in delta.removed.iter().chain(&delta.evicted) {
                    println!("- {}", id);
                }
            }
            Some(TraceEvent::Packets(n)) if n > 0 => {
                println!(
                    "  {} packets ({} in window)",
                    n,
                    tracer.registry().packets().len()
                );
            }
            Some(TraceEvent::PollFailed(e)) if !e.is_transport() => eprintln!("{}", e),
            Some(TraceEvent::Disconnected) => tracing::warn!("backend disconnected, reconnecting"),
            Some(TraceEvent::Connected { sync_errors, .. }) => {
                tracing::info!("backend reconnected");
                for e in sync_errors {
                    tracing::warn!("{}", e);
                }
            }
            _ => {}
        }
    }

    if table {
        tracer.set_view_options(view.options());
        let projected = tracer.view();
        if let Some(bad) = &projected.bad_filter {
            tracing::warn!("{}", bad);
        }
        print_rows(&projected.rows, tracer.view_options().summarized);
    }
    Ok(())
}

fn connections(conn: &ConnOpts) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let records = proxy.get_connections().map_err(|e| eprintln!("{}", e))?;
    for rec in records {
        let flow = connview::flow::Flow::from_record(rec);
        println!(
            "{:<8} {:<8} {:?} {}",
            flow.identity.layer_type, flow.identity.next_layer_type, flow.direction, flow.label
        );
    }
    Ok(())
}

fn fetch_view(proxy: &RemoteProxy, view: &ViewArgs) -> Result<Vec<ViewRow>, ()> {
    let mut packets = proxy.get_packets().map_err(|e| eprintln!("{}", e))?;
    // Newest first on the wire.
    packets.reverse();
    let projected = view::project(&packets, &view.options());
    if let Some(bad) = &projected.bad_filter {
        tracing::warn!("{}", bad);
    }
    Ok(projected.rows)
}

fn packets(conn: &ConnOpts, view: &ViewArgs) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let rows = fetch_view(&proxy, view)?;
    print_rows(&rows, view.summarize);
    Ok(())
}

fn export_csv(conn: &ConnOpts, file: Option<String>, view: &ViewArgs) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let rows = fetch_view(&proxy, view)?;
    let written = match &file {
        Some(path) => {
            let f = File::create(path).map_err(|e| eprintln!("Cannot create {}: {}", path, e))?;
            export::write_csv(&mut BufWriter::new(f), &rows)
        }
        None => export::write_csv(&mut io::stdout().lock(), &rows),
    }
    .map_err(|e| eprintln!("{}", e))?;
    if let Some(path) = file {
        eprintln!("Exported {} rows to {}", written, path);
    }
    Ok(())
}

fn show_settings(s: &Settings) {
    println!("max-packet-cache:       {}", s.max_packet_cache);
    println!("max-connections-cache:  {}", s.max_connections_cache);
    println!("db-path:                {}", s.db_path);
    println!("db-download-url:        {}", s.db_download_url);
    println!("connections-interval-ms {}", s.connections_interval.as_millis());
    println!("packets-interval-ms:    {}", s.packets_interval.as_millis());
    println!("summarized:             {}", s.summarized);
    println!("dark-theme:             {}", s.dark_theme);
    match s.fallback_location {
        Some(loc) => println!("local-location:         {},{}", loc.longitude, loc.latitude),
        None => println!("local-location:         unset"),
    }
    println!("public-address:         {}", s.public_address);
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ()> {
    value
        .parse()
        .map_err(|_| eprintln!("Invalid value for {}: {}", key, value))
}

fn set_setting<S: SettingsStore>(
    sync: &mut SettingsSync<S>,
    conn: &ConnOpts,
    key: &str,
    value: &str,
) -> Result<(), ()> {
    let local = |res: Result<(), connview::settings::SettingsError>| res.map_err(|e| eprintln!("{}", e));
    match key {
        "connections-interval-ms" => {
            let ms: u64 = parse(key, value)?;
            let packets = sync.settings().packets_interval;
            return local(sync.set_intervals(Duration::from_millis(ms), packets));
        }
        "packets-interval-ms" => {
            let ms: u64 = parse(key, value)?;
            let connections = sync.settings().connections_interval;
            return local(sync.set_intervals(connections, Duration::from_millis(ms)));
        }
        "dark-theme" => return local(sync.set_dark_theme(parse(key, value)?)),
        "public-address" => return local(sync.set_public_address(value)),
        "local-location" => {
            if value == "unset" {
                return local(sync.set_fallback_location(None));
            }
            let (lon, lat) = value
                .split_once(',')
                .ok_or_else(|| eprintln!("Expected LONGITUDE,LATITUDE"))?;
            let loc = Location::new(parse(key, lon.trim())?, parse(key, lat.trim())?);
            return local(sync.set_fallback_location(Some(loc)));
        }
        _ => {}
    }

    let proxy = connect(conn)?;
    let res = match key {
        "max-packet-cache" => sync.set_max_packet_cache(&proxy, parse(key, value)?),
        "max-connections-cache" => sync.set_max_connections_cache(&proxy, parse(key, value)?),
        "db-path" => sync.set_db_path(&proxy, value),
        "db-download-url" => sync.set_db_download_url(&proxy, value),
        "summarized" => sync.set_summarized(&proxy, parse(key, value)?),
        _ => {
            eprintln!("Unknown setting: {}", key);
            return Err(());
        }
    };
    res.map_err(|e| eprintln!("{}", e))
}

fn settings(conn: &ConnOpts, command: SettingsCommand) -> Result<(), ()> {
    let mut sync = conn.load_settings().map_err(|e| eprintln!("{}", e))?;
    match command {
        SettingsCommand::Show => {
            match conn.connect() {
                Ok(proxy) => {
                    for e in sync.synchronize(&proxy) {
                        tracing::warn!("{}", e);
                    }
                }
                Err(e) => tracing::warn!("{}, showing local settings", e),
            }
            show_settings(sync.settings());
            Ok(())
        }
        SettingsCommand::Set { key, value } => set_setting(&mut sync, conn, &key, &value),
    }
}

fn db(conn: &ConnOpts, command: DbCommand) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let report = |e: connview::remote::RemoteError| eprintln!("{}", e);
    match command {
        DbCommand::Check => {
            if proxy.check_database().map_err(report)? {
                println!("Database missing, download required");
            } else {
                println!("Database present");
            }
        }
        DbCommand::Download { license_key } => {
            proxy.download_database(&license_key).map_err(report)?;
            println!("Database downloaded");
        }
        DbCommand::Upload { file } => {
            let f = File::open(&file).map_err(|e| eprintln!("Cannot open {}: {}", file, e))?;
            proxy.upload_database(Box::new(f)).map_err(report)?;
            println!("Database uploaded");
        }
        DbCommand::Delete => {
            proxy.delete_database().map_err(report)?;
            println!("Database deleted");
        }
        DbCommand::Path { value: None } => println!("{}", proxy.get_db_path().map_err(report)?),
        DbCommand::Path { value: Some(path) } => proxy.set_db_path(&path).map_err(report)?,
        DbCommand::Url { value: None } => {
            println!("{}", proxy.get_db_download_url().map_err(report)?)
        }
        DbCommand::Url { value: Some(url) } => proxy.set_db_download_url(&url).map_err(report)?,
    }
    Ok(())
}

fn restart(conn: &ConnOpts, fix_permissions: bool) -> Result<(), ()> {
    let proxy = connect(conn)?;
    match proxy.restart_app(fix_permissions) {
        Ok(()) => Ok(()),
        // The link going down is how a restart usually looks from here.
        Err(e) if e.is_transport() => {
            eprintln!("Backend is restarting");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            Err(())
        }
    }
}

fn lookup(conn: &ConnOpts, ip: &str) -> Result<(), ()> {
    let proxy = connect(conn)?;
    let loc = proxy.lookup_location(ip).map_err(|e| eprintln!("{}", e))?;
    println!("{} longitude {} latitude {}", ip, loc.longitude, loc.latitude);
    Ok(())
}

fn open_link(conn: &ConnOpts, url: &str) -> Result<(), ()> {
    let proxy = connect(conn)?;
    proxy.open_external_link(url).map_err(|e| eprintln!("{}", e))
}

fn verbosity(command: &Commands) -> u8 {
    match command {
        Commands::Devices { conn }
        | Commands::Trace { conn, .. }
        | Commands::Connections { conn }
        | Commands::Packets { conn, .. }
        | Commands::Export { conn, .. }
        | Commands::Settings { conn, .. }
        | Commands::Db { conn, .. }
        | Commands::Restart { conn, .. }
        | Commands::Lookup { conn, .. }
        | Commands::Open { conn, .. } => conn.verbose,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(verbosity(&cli.command));

    let result = match cli.command {
        Commands::Devices { conn } => list_devices(&conn),
        Commands::Trace {
            conn,
            device,
            duration,
            table,
            view,
        } => trace(&conn, device, duration, table, &view),
        Commands::Connections { conn } => connections(&conn),
        Commands::Packets { conn, view } => packets(&conn, &view),
        Commands::Export { conn, file, view } => export_csv(&conn, file, &view),
        Commands::Settings { conn, command } => settings(&conn, command),
        Commands::Db { conn, command } => db(&conn, command),
        Commands::Restart {
            conn,
            fix_permissions,
        } => restart(&conn, fix_permissions),
        Commands::Lookup { conn, ip } => lookup(&conn, &ip),
        Commands::Open { conn, url } => open_link(&conn, &url),
    };

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        eprintln!("FAILED");
        ExitCode::FAILURE
    }
}
