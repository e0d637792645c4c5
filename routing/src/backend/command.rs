use crate::errors::RoutingError;
use crate::route::{Route, RouteRequest};
use common::types::PairId;
use geo::{Coord, LineString};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A local routing engine started once per batch. It reads one JSON request per line on stdin,
/// e.g. `{"id":0,"profile":"bike","origin":[-1.55,53.8],"destination":[-1.54,53.81]}`, and
/// writes one JSON reply per line on stdout, either
/// `{"id":0,"geometry":[[-1.55,53.8],...],"distance":1204.5,"duration":301.0}` or
/// `{"id":0,"error":"no route","transient":false}`. Replies may come in any order.
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    id: PairId,
    profile: &'a str,
    origin: [f64; 2],
    destination: [f64; 2],
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    id: PairId,
    geometry: Option<Vec<[f64; 2]>>,
    distance: Option<f64>,
    duration: Option<f64>,
    #[serde(default)]
    attributes: BTreeMap<String, f64>,
    error: Option<String>,
    #[serde(default)]
    transient: bool,
}

impl CommandProvider {
    pub fn new(program: &str, args: Vec<String>, batch_size: usize) -> Self {
        Self { program: program.to_string(), args, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) async fn route(&self, request: &RouteRequest) -> Result<Route, RoutingError> {
        self.route_batch(std::slice::from_ref(request)).await
            .pop()
            .map(|(_, result)| result)
            .unwrap_or_else(|| Err(RoutingError::Permanent(format!("{} did not answer", self.program))))
    }

    pub(crate) async fn route_batch(&self, requests: &[RouteRequest]) -> Vec<(PairId, Result<Route, RoutingError>)> {
        match self.run(requests).await {
            Ok(output) => match_replies(requests, &output),
            Err(err) => requests.iter().map(|request| (request.id(), Err(err.clone()))).collect(),
        }
    }

    async fn run(&self, requests: &[RouteRequest]) -> Result<String, RoutingError> {
        let mut input = String::new();
        for request in requests {
            let line = serde_json::to_string(&CommandRequest {
                id: request.id(),
                profile: request.profile.as_str(),
                origin: [request.pair.origin.x, request.pair.origin.y],
                destination: [request.pair.destination.x, request.pair.destination.y],
            }).map_err(|err| RoutingError::Permanent(err.to_string()))?;
            input.push_str(&line);
            input.push('\n');
        }

        debug!(target: "backend", "Starting {} for {} requests", self.program, requests.len());
        // The process is killed if the benchmark cancels the request
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RoutingError::Permanent(format!("Starting {}: {}", self.program, err)))?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(RoutingError::Transient(format!("No stdin for {}", self.program)));
        };
        // Write while reading, a large batch would otherwise fill both pipes
        let write = async move {
            let written = stdin.write_all(input.as_bytes()).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output = output.map_err(|err| RoutingError::Transient(format!("Running {}: {}", self.program, err)))?;
        if !output.status.success() {
            return Err(RoutingError::Transient(format!(
                "{} exited with {}: {}",
                self.program, output.status, String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if let Err(err) = written {
            return Err(RoutingError::Transient(format!("Writing to {}: {}", self.program, err)));
        }

        String::from_utf8(output.stdout)
            .map_err(|err| RoutingError::Permanent(format!("{} wrote invalid UTF-8: {}", self.program, err)))
    }
}

/// One result per request. Requests without a reply failed permanently.
fn match_replies(requests: &[RouteRequest], output: &str) -> Vec<(PairId, Result<Route, RoutingError>)> {
    let mut replies = HashMap::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<CommandReply>(line) {
            Ok(reply) => {
                replies.insert(reply.id, reply);
            }
            Err(err) => warn!(target: "backend", "Ignoring invalid reply '{}': {}", line, err),
        }
    }

    requests.iter()
        .map(|request| {
            let result = match replies.remove(&request.id()) {
                Some(reply) => reply.into_route(),
                None => Err(RoutingError::Permanent(format!("No reply for pair {}", request.id()))),
            };
            (request.id(), result)
        })
        .collect()
}

impl CommandReply {
    fn into_route(self) -> Result<Route, RoutingError> {
        if let Some(error) = self.error {
            return Err(if self.transient {
                RoutingError::Transient(error)
            } else {
                RoutingError::Permanent(error)
            });
        }

        match (self.geometry, self.distance, self.duration) {
            (Some(geometry), Some(distance), Some(duration)) => {
                let geometry: LineString<f64> = geometry.into_iter().map(|[x, y]| Coord { x, y }).collect();
                let mut route = Route::new(geometry, distance, duration);
                route.attributes = self.attributes;
                Ok(route)
            }
            _ => Err(RoutingError::Permanent(format!("Incomplete reply for pair {}", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use common::types::{OdPair, Profile};

    fn requests(n: u32) -> Vec<RouteRequest> {
        (0..n)
            .map(|id| {
                let pair = OdPair {
                    id: PairId(id),
                    origin_id: format!("O{id}"),
                    destination_id: format!("D{id}"),
                    origin: Coord { x: -1.5, y: 53.8 },
                    destination: Coord { x: -1.4, y: 53.7 },
                    weight: 1.0,
                };
                RouteRequest::new(pair, Profile::from("bike"))
            })
            .collect()
    }

    #[test]
    fn test_match_replies_out_of_order() {
        let output = r#"
{"id":2,"error":"engine busy","transient":true}
not json
{"id":0,"geometry":[[-1.5,53.8],[-1.4,53.7]],"distance":1200.0,"duration":300.0,"attributes":{"quietness":60}}
"#;

        let results = match_replies(&requests(4), output);

        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().map(|(id, _)| id.0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let route = results[0].1.as_ref().unwrap();
        assert_eq!(route.distance, 1200.0);
        assert_eq!(route.attributes["quietness"], 60.0);
        assert_eq!(results[1].1.as_ref().unwrap_err().kind(), ErrorKind::Permanent);
        assert_eq!(results[2].1.as_ref().unwrap_err().kind(), ErrorKind::Transient);
        assert_eq!(results[3].1.as_ref().unwrap_err().kind(), ErrorKind::Permanent);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_with_partial_failures() {
        let script = r#"cat > /dev/null
echo '{"id":0,"geometry":[[-1.5,53.8],[-1.4,53.7]],"distance":1200,"duration":300}'
echo '{"id":1,"error":"no route"}'"#;
        let provider = CommandProvider::new("sh", vec!["-c".into(), script.into()], 3);

        let results = provider.route_batch(&requests(3)).await;

        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1.as_ref().unwrap_err(), &RoutingError::Permanent("no route".into()));
        assert_eq!(results[2].1.as_ref().unwrap_err().kind(), ErrorKind::Permanent);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_process_is_transient() {
        let provider = CommandProvider::new("sh", vec!["-c".into(), "exit 3".into()], 1);

        let result = provider.route(&requests(1)[0]).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let provider = CommandProvider::new("./does-not-exist-routebench-engine", vec![], 1);

        let result = provider.route(&requests(1)[0]).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Permanent);
    }
}
