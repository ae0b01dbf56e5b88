//! Compact line framing
//!
//! One session per connection: single-line commands run sequentially
//! until the peer closes. Names are single whitespace-free tokens in
//! this dialect; anything richer travels over the textual dialect.
//!
//! ```text
//! UPLOAD <name> <length>   + raw bytes   -> OK / ERR
//! DOWNLOAD <name>                        -> <length> + raw bytes, or ERR
//! DELETE <name>                          -> OK / ERR
//! LIST                                   -> one name per line, then END
//! SYNC                                   -> UPLOAD:/DOWNLOAD:/CONFLICT: lines, then END
//! ```

use std::io;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{read_line_bounded, Command, Outcome, ProtocolError, MAX_BODY_SIZE};

/// Reads the next command in the session. `Ok(None)` is a clean close.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<Command>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = loop {
        match read_line_bounded(reader, "command line").await? {
            None => return Ok(None),
            Some(l) if l.trim().is_empty() => continue,
            Some(l) => break l,
        }
    };

    let mut parts = line.split_whitespace();
    let verb = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed("empty command"))?;
    match verb {
        "UPLOAD" => {
            let name = required_token(&mut parts, "UPLOAD <name>")?;
            let len = required_token(&mut parts, "UPLOAD <name> <length>")?
                .parse::<usize>()
                .map_err(|_| ProtocolError::malformed(format!("bad length in '{line}'")))?;
            if len > MAX_BODY_SIZE {
                return Err(ProtocolError::TooLarge {
                    what: "body",
                    limit: MAX_BODY_SIZE,
                });
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(Some(Command::Upload {
                name,
                body,
                checksum: None,
                chunk: None,
            }))
        }
        "DOWNLOAD" => Ok(Some(Command::Download {
            name: required_token(&mut parts, "DOWNLOAD <name>")?,
        })),
        "DELETE" => Ok(Some(Command::Delete {
            name: required_token(&mut parts, "DELETE <name>")?,
        })),
        "LIST" => Ok(Some(Command::List)),
        "SYNC" => Ok(Some(Command::Sync { manifest: None })),
        other => Err(ProtocolError::malformed(format!("unknown command '{other}'"))),
    }
}

fn required_token(
    parts: &mut std::str::SplitWhitespace<'_>,
    usage: &str,
) -> Result<String, ProtocolError> {
    parts
        .next()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::malformed(format!("usage: {usage}")))
}

pub async fn write_outcome<W>(writer: &mut W, outcome: &Outcome) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match outcome {
        Outcome::Saved { .. }
        | Outcome::ChunkStored { .. }
        | Outcome::Deleted { .. }
        | Outcome::JobStarted { .. }
        | Outcome::Healthy => writer.write_all(b"OK\n").await?,
        Outcome::File { body, .. } | Outcome::Archive { body } => {
            writer
                .write_all(format!("{}\n", body.len()).as_bytes())
                .await?;
            writer.write_all(body).await?;
        }
        Outcome::Listing { names } => {
            let mut out = String::new();
            for name in names {
                out.push_str(name);
                out.push('\n');
            }
            out.push_str("END\n");
            writer.write_all(out.as_bytes()).await?;
        }
        Outcome::Report { report } => {
            let out = format!(
                "UPLOAD:{}\nDOWNLOAD:{}\nCONFLICT:{}\nEND\n",
                report.files_to_upload.join(","),
                report.files_to_download.join(","),
                report.conflict_files.join(",")
            );
            writer.write_all(out.as_bytes()).await?;
        }
        // reasons stay in the server log; this dialect only says ERR
        Outcome::Failure { .. } => writer.write_all(b"ERR\n").await?,
    }
    writer.flush().await
}
