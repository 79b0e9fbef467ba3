use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frame::{read_frame_limited, write_frame},
    protocol::{BROADCAST_TARGET, OutboundMessage, Recipient, ServerToClient},
};

// Membership updates grow with the number of peers, so server frames get more room
// than the per-message cap the relay enforces on clients.
const MAX_SERVER_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_frame(&mut writer, &args.username)
        .await
        .context("failed to send username")?;

    // Frames are read on their own task: frame reads are not cancel safe,
    // so it cannot share a `select!` with stdin.
    let mut printer = tokio::spawn(print_server_frames(reader));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut printer, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;
    printer.abort();

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    printer: &mut JoinHandle<io::Result<()>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            printed = &mut *printer => {
                printed.context("server reader task failed")??;
                break;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn print_server_frames(mut reader: BufReader<OwnedReadHalf>) -> io::Result<()> {
    while let Some(payload) = read_frame_limited(&mut reader, MAX_SERVER_FRAME_LEN).await? {
        write_stdout(&render_server_message(ServerToClient::decode(&payload))).await?;
    }
    write_stdout("*** server closed the connection").await
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_frame(writer, &outgoing_payload(text)).await?;
    Ok(true)
}

/// Lines already shaped as `recipient:content` go out untouched; anything
/// else is addressed to everyone.
fn outgoing_payload(line: &str) -> String {
    if line.contains(':') {
        return line.to_string();
    }
    OutboundMessage {
        recipient: Recipient::All,
        content: line.to_string(),
    }
    .encode()
}

fn render_server_message(message: ServerToClient) -> String {
    match message {
        ServerToClient::UserList { names } => {
            let online: Vec<_> = names
                .into_iter()
                .filter(|name| name != BROADCAST_TARGET)
                .collect();
            format!("*** online: {}", online.join(", "))
        }
        ServerToClient::Relay { content } => content,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
