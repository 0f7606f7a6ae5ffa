//! The Unix-socket accept loop: one task and one [Session] per
//! connection, line-framed JSON requests in, one JSON line out per
//! request.

use std::sync::Arc;

use farview_cache::{FileService, Session};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::proto;

/// Serves connections until the listener fails. Session state dies
/// with its connection; the cached tree is shared through `service`.
pub async fn serve(listener: UnixListener, service: Arc<FileService>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    debug!("client connected");
                    if let Err(e) = handle_connection(stream, service).await {
                        warn!(error = %e, "connection failed");
                    }
                    debug!("client disconnected");
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<FileService>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut session = Session::new(service);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = dispatch(&mut session, &line).await;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }
    // EOF tears the session down, releasing its open handles.
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("{0}")]
    Service(#[from] farview_cache::Error),
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown request type {0:?}")]
    UnknownType(String),
}

/// Runs one request line against the session and serializes the
/// response envelope.
pub async fn dispatch(session: &mut Session, line: &str) -> String {
    let response = match run_request(session, line).await {
        Ok(payload) => proto::Response {
            kind: "result",
            payload,
        },
        Err(e) => proto::Response {
            kind: "error",
            payload: serde_json::to_value(proto::ErrorResponse {
                message: e.to_string(),
            })
            .expect("serializing an error response"),
        },
    };
    serde_json::to_string(&response).expect("serializing a response")
}

async fn run_request(
    session: &mut Session,
    line: &str,
) -> Result<serde_json::Value, RequestError> {
    let request: proto::Request = serde_json::from_str(line)?;
    let payload = request.payload;

    Ok(match request.kind.as_str() {
        "open" => {
            let req: proto::OpenRequest = serde_json::from_value(payload)?;
            let fd = session.open(&req.path).await?;
            serde_json::to_value(proto::OpenResponse { fd })?
        }
        "close" => {
            let req: proto::CloseRequest = serde_json::from_value(payload)?;
            session.close(req.fd)?;
            serde_json::to_value(proto::Empty::default())?
        }
        "read" => {
            let req: proto::ReadRequest = serde_json::from_value(payload)?;
            let data = session.read(req.fd, req.length).await?;
            serde_json::to_value(proto::ReadResponse { data })?
        }
        "listdir" => {
            let req: proto::ListDirRequest = serde_json::from_value(payload)?;
            let entries = session
                .listdir(&req.path)
                .await?
                .into_iter()
                .map(|e| proto::DirEntry {
                    name: e.name,
                    size: e.size,
                    inode: e.inode,
                    is_dir: e.is_dir,
                })
                .collect();
            serde_json::to_value(proto::ListDirResponse { entries })?
        }
        "forget" => {
            let req: proto::ForgetRequest = serde_json::from_value(payload)?;
            session.forget(&req.path).await?;
            serde_json::to_value(proto::Empty::default())?
        }
        "diag" => serde_json::to_value(session.diagnostics().await)?,
        other => return Err(RequestError::UnknownType(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use farview_cache::remote::DirRemote;
    use std::path::Path;

    fn write_file(path: &Path, pattern: &str, count: usize) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, pattern.repeat(count)).unwrap();
    }

    async fn test_session() -> (tempfile::TempDir, tempfile::TempDir, Session) {
        let remote_dir = tempfile::tempdir().unwrap();
        write_file(&remote_dir.path().join("f1"), "f1", 10);
        write_file(&remote_dir.path().join("d1/f1"), "d1f1", 30);

        let work_dir = tempfile::tempdir().unwrap();
        let service = FileService::new(
            Arc::new(DirRemote::new(remote_dir.path())),
            work_dir.path(),
            10_000,
        )
        .unwrap();
        let session = Session::new(service);
        (remote_dir, work_dir, session)
    }

    #[tokio::test]
    async fn dispatches_the_protocol() {
        let (_remote, _work, mut session) = test_session().await;

        let response = dispatch(
            &mut session,
            r#"{"Type": "open", "Payload": {"Path": "f1"}}"#,
        )
        .await;
        assert_eq!(response, r#"{"Type":"result","Payload":{"FD":0}}"#);

        let response = dispatch(
            &mut session,
            r#"{"Type": "read", "Payload": {"FD": 0, "Length": 3}}"#,
        )
        .await;
        assert_eq!(response, r#"{"Type":"result","Payload":{"Data":"ZjFm"}}"#);

        let response = dispatch(&mut session, r#"{"Type": "close", "Payload": {"FD": 0}}"#).await;
        assert_eq!(response, r#"{"Type":"result","Payload":{}}"#);

        let response = dispatch(&mut session, r#"{"Type": "close", "Payload": {"FD": 0}}"#).await;
        assert_eq!(
            response,
            r#"{"Type":"error","Payload":{"Message":"invalid handle"}}"#
        );

        let response = dispatch(
            &mut session,
            r#"{"Type": "listdir", "Payload": {"Path": "f1"}}"#,
        )
        .await;
        assert_eq!(
            response,
            r#"{"Type":"error","Payload":{"Message":"not a directory"}}"#
        );

        let response = dispatch(&mut session, r#"{"Type": "nope", "Payload": {}}"#).await;
        assert_eq!(
            response,
            r#"{"Type":"error","Payload":{"Message":"unknown request type \"nope\""}}"#
        );
    }

    #[tokio::test]
    async fn listdir_reports_entries() {
        let (_remote, _work, mut session) = test_session().await;

        let response = dispatch(
            &mut session,
            r#"{"Type": "listdir", "Payload": {"Path": ""}}"#,
        )
        .await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["Type"], "result");
        let mut names: Vec<&str> = value["Payload"]["Entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["Name"].as_str().unwrap())
            .collect();
        names.sort_unstable();
        assert_eq!(names, [".", "..", "d1", "f1"]);
    }

    #[tokio::test]
    async fn diag_reports_the_tree() {
        let (_remote, _work, mut session) = test_session().await;
        let response = dispatch(&mut session, r#"{"Type": "diag", "Payload": {}}"#).await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["Type"], "result");
        assert_eq!(value["Payload"]["OpenFiles"], 0);
        assert_eq!(value["Payload"]["Service"]["Transfer"]["BlocksRequested"], 0);
    }
}
