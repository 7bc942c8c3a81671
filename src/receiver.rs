use tracing::{debug, error, info, trace, warn};
use rtt_stream::logging::init;

use rtt_stream::config::{DEFAULT_FEC_PAYLOAD_TYPE, DEFAULT_RED_PAYLOAD_TYPE};
use rtt_stream::grapheme::BACKSPACE;
use rtt_stream::{DemuxEvent, Demultiplexer, RttError};

use std::io::Write;
use std::net::SocketAddr;
use std::process::ExitCode;

const MAX_DATAGRAM_SIZE: usize = 65535;
const SOCKET_TOKEN: mio::Token = mio::Token(0);

fn usage(cmd: &str) {
    println!("用法: {cmd} BIND_ADDR [--red PT] [--fec PT]");
    println!("\n在 BIND_ADDR 上接收 RTP 实时文本并按流输出到标准输出。");
}

/// 终端显示：退格擦除前一个字符
fn render(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == BACKSPACE {
            out.push_str("\u{8} \u{8}");
        } else {
            out.push(c);
        }
    }
    out
}

fn run(bind: SocketAddr, mut demux: Demultiplexer) -> Result<(), RttError> {
    let resource = |what: &str, e: std::io::Error| RttError::Resource(format!("{what}: {e}"));

    let mut poll = mio::Poll::new().map_err(|e| resource("poll", e))?;
    let mut events = mio::Events::with_capacity(1024);

    let mut socket = mio::net::UdpSocket::bind(bind).map_err(|e| resource("bind", e))?;
    poll.registry()
        .register(&mut socket, SOCKET_TOKEN, mio::Interest::READABLE)
        .map_err(|e| resource("register", e))?;
    info!("接收端监听 {}", socket.local_addr().map_err(|e| resource("local_addr", e))?);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let stdout = std::io::stdout();
    let mut current: Option<String> = None;

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(resource("poll", e));
        }

        // 读到 WouldBlock 为止
        loop {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!("接收操作将阻塞");
                    break;
                }
                Err(e) => return Err(resource("recv", e)),
            };
            debug!("收到 {} 字节 来自 {}", len, from);

            let decoded = match demux.process(&buf[..len]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("丢弃报文 ({} 字节): {}", len, e);
                    continue;
                }
            };

            let mut out = stdout.lock();
            for event in decoded {
                match event {
                    DemuxEvent::NewStream(id) => info!("新流 {}", id),
                    DemuxEvent::Text { stream_id, text } => {
                        if current.as_deref() != Some(stream_id.as_str()) {
                            let _ = write!(out, "\n[{stream_id}] ");
                            current = Some(stream_id);
                        }
                        let _ = write!(out, "{}", render(&text));
                    }
                    DemuxEvent::Metadata { stream_id, metadata } => {
                        info!("流 {} 元数据: {:?}", stream_id, metadata);
                    }
                }
            }
            let _ = out.flush();
        }
    }
}

fn main() -> ExitCode {
    // 日志系统初始化
    init("info");

    let mut args = std::env::args();
    let cmd = args.next().unwrap_or_else(|| "rtt-receiver".to_string());

    let Some(bind) = args.next().and_then(|a| a.parse::<SocketAddr>().ok()) else {
        usage(&cmd);
        return ExitCode::FAILURE;
    };

    let mut red = DEFAULT_RED_PAYLOAD_TYPE;
    let mut fec = DEFAULT_FEC_PAYLOAD_TYPE;
    while let Some(flag) = args.next() {
        let value = args.next().and_then(|v| v.parse::<u8>().ok());
        match (flag.as_str(), value) {
            ("--red", Some(pt)) => red = pt,
            ("--fec", Some(pt)) => fec = pt,
            _ => {
                usage(&cmd);
                return ExitCode::FAILURE;
            }
        }
    }

    let demux = Demultiplexer::new()
        .with_red_payload_type(red)
        .with_fec_payload_type(fec);

    match run(bind, demux) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} 错误: {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}
