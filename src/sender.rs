use tracing::{debug, error, info, warn};
use rtt_stream::logging::init;

use rtt_stream::config::TransportConfig;
use rtt_stream::source::{SourceEvent, Upstream};
use rtt_stream::{RttError, Transport, TransportEvent, open_sink};

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Instant;

const WAKE_TOKEN: mio::Token = mio::Token(0);

fn usage(cmd: &str) {
    println!("用法: {cmd} SINK_URL [--rate CPS] [--fec N] [--red N] [--stream ID] [--no-backspace]");
    println!("\n从标准输入逐行读取文本，按实时文本节奏发送到 SINK_URL（udp://host:port、unix:///path）。");
}

fn parse_config(args: &mut impl Iterator<Item = String>) -> Result<TransportConfig, String> {
    let mut config = TransportConfig::default();
    while let Some(flag) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{name} 缺少参数"));
        config = match flag.as_str() {
            "--rate" => config.with_char_rate_limit(value("--rate")?.parse().map_err(|e| format!("--rate: {e}"))?),
            "--fec" => config.with_fec(value("--fec")?.parse().map_err(|e| format!("--fec: {e}"))?),
            "--red" => config.with_red(value("--red")?.parse().map_err(|e| format!("--red: {e}"))?),
            "--stream" => config.with_stream_prefix(value("--stream")?),
            "--no-backspace" => config.with_process_backspaces(false),
            other => return Err(format!("未知参数 {other}")),
        };
    }
    Ok(config)
}

fn run(endpoint: &str, config: TransportConfig) -> Result<(), RttError> {
    let tick = config.tick_interval;
    let sink = open_sink(endpoint)?;
    let mut transport = Transport::new(config, sink, Instant::now())?;

    let mut poll = mio::Poll::new().map_err(|e| RttError::Resource(format!("poll: {e}")))?;
    let mut events = mio::Events::with_capacity(16);
    let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN).map_err(|e| RttError::Resource(format!("waker: {e}")))?;

    // stdin 是阻塞的，放到独立线程读取，通过 waker 唤醒事件循环
    let (tx, rx) = mpsc::channel::<SourceEvent>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let event = match line {
                Ok(mut line) => {
                    line.push('\n');
                    SourceEvent::Chunk(line.into())
                }
                Err(e) => SourceEvent::Error(e.to_string()),
            };
            let stop = matches!(event, SourceEvent::Error(_));
            let sent = tx.send(event).is_ok();
            let _ = waker.wake();
            if stop || !sent {
                return;
            }
        }
        let _ = tx.send(SourceEvent::End);
        let _ = waker.wake();
    });

    info!("发送端启动: {} (session {})", endpoint, transport.session_id());

    while !transport.is_closed() {
        if let Err(e) = poll.poll(&mut events, Some(tick)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                return Err(RttError::Resource(format!("poll: {e}")));
            }
        }

        loop {
            match rx.try_recv() {
                Ok(event) => transport.deliver(event),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    transport.deliver(SourceEvent::End);
                    break;
                }
            }
        }

        transport.tick(Instant::now());

        while let Some(event) = transport.poll_event() {
            match event {
                TransportEvent::Error { kind, message } => warn!("{}: {}", kind, message),
                TransportEvent::SourceError { message, .. } => error!("输入错误: {}", message),
                TransportEvent::StreamRemoved { stream_id } => debug!("流 {} 已移除", stream_id),
                TransportEvent::Closed => info!("传输已关闭"),
            }
        }
    }

    info!("发送统计: {:?}", transport.stats());
    Ok(())
}

fn main() -> ExitCode {
    // 日志系统初始化
    init("info");

    let mut args = std::env::args();
    let cmd = args.next().unwrap_or_else(|| "rtt-sender".to_string());

    let Some(endpoint) = args.next() else {
        usage(&cmd);
        return ExitCode::FAILURE;
    };

    let config = match parse_config(&mut args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            usage(&cmd);
            return ExitCode::FAILURE;
        }
    };

    match run(&endpoint, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} 错误: {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}
