use super::*;
use crate::{build::BuildDir, store::test_store};
use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread::JoinHandle,
    time::Instant,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    addr: SocketAddr,
    ctx: Arc<ServeContext>,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let (dir, store) = test_store();
        let hub = Arc::new(EventHub::new(Sources {
            build: Arc::new(ValueObservable::new(json!("1"))),
            store: store.clone(),
            tick: Duration::from_millis(50),
        }));
        let ctx = Arc::new(ServeContext {
            hub,
            store,
            builds: Arc::new(BuildState::new()),
            keepalive: Duration::from_millis(50),
        });

        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let handle = {
            let (server, ctx) = (Arc::clone(&server), Arc::clone(&ctx));
            thread::spawn(move || run_request_loop(&server, &ctx).unwrap())
        };

        Self {
            _dir: dir,
            addr,
            ctx,
            server,
            handle: Some(handle),
        }
    }

    /// Serve a build containing `index.html` and `404.html`.
    fn with_site(self) -> Self {
        let site = self._dir.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<html><body>home</body></html>").unwrap();
        fs::write(site.join("404.html"), "<body>gone</body>").unwrap();
        fs::write(site.join("app.css"), "body{}").unwrap();
        self.ctx.builds.serve_dir(BuildDir {
            id: "1".into(),
            path: site,
        });
        self
    }

    fn request(&self, method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> Reply {
        let mut stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            self.addr,
            body.len()
        )
        .unwrap();
        for (name, value) in headers {
            write!(stream, "{name}: {value}\r\n").unwrap();
        }
        write!(stream, "\r\n{body}").unwrap();

        let mut raw = String::new();
        BufReader::new(stream).read_to_string(&mut raw).unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let status = head.split(' ').nth(1).unwrap().parse().unwrap();
        Reply {
            status,
            head: head.to_string(),
            body: body.to_string(),
        }
    }

    fn post(&self, path: &str, body: Value, referer: Option<&str>) -> Reply {
        let headers: Vec<_> = referer.into_iter().map(|r| ("Referer", r)).collect();
        self.request("POST", path, &headers, &body.to_string())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Reply {
    status: u16,
    head: String,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Reads JSON lines from a watch stream, skipping chunk framing and
/// keep-alives.
struct Stream {
    reader: BufReader<TcpStream>,
}

impl Stream {
    fn open(addr: SocketAddr, body: Value) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let body = body.to_string();
        write!(
            stream,
            "POST /_events/watch HTTP/1.1\r\nHost: {addr}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn next_json(&mut self) -> Value {
        loop {
            let mut line = String::new();
            assert!(self.reader.read_line(&mut line).unwrap() > 0, "stream ended");
            if line.starts_with('{') {
                return serde_json::from_str(line.trim_end()).unwrap();
            }
        }
    }
}

#[test]
fn test_no_build_yet() {
    let h = Harness::start();

    let reply = h.request("GET", "/", &[], "");
    assert_eq!(reply.status, 503);
    assert!(reply.body.contains(embed::CLIENT_JS_PATH));

    let reply = h.request("GET", embed::CLIENT_JS_PATH, &[], "");
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("text/javascript"));
    assert_eq!(reply.body, embed::CLIENT_JS);
}

#[test]
fn test_static_files() {
    let h = Harness::start().with_site();

    let reply = h.request("GET", "/", &[], "");
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("no-cache"));
    assert_eq!(
        reply.body,
        format!("<html><body>home{}</body></html>", embed::client_script_tag())
    );

    let reply = h.request("GET", "/app.css?v=2", &[], "");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "body{}");

    let reply = h.request("HEAD", "/", &[], "");
    assert_eq!(reply.status, 200);
    assert!(reply.body.is_empty());

    let reply = h.request("GET", "/missing/", &[], "");
    assert_eq!(reply.status, 404);
    assert!(reply.body.starts_with("<body>gone<script"));

    let reply = h.request("GET", "/../secret", &[], "");
    assert_eq!(reply.status, 404);
}

#[test]
fn test_method_not_allowed() {
    let h = Harness::start().with_site();

    assert_eq!(h.request("PUT", "/", &[], "").status, 405);
    assert_eq!(h.request("GET", "/_events/sub", &[], "").status, 405);
    assert_eq!(h.request("GET", "/_events/watch", &[], "").status, 405);
}

#[test]
fn test_sub_errors() {
    let h = Harness::start();

    let reply = h.post("/_events/sub", json!({"sid": "nope", "add": []}), None);
    assert_eq!(reply.status, 404);
    assert_eq!(reply.json(), json!({"error": "session not found"}));

    let reply = h.request("POST", "/_events/sub", &[], "{not json");
    assert_eq!(reply.status, 400);
    assert!(reply.json()["error"].is_string());
}

#[test]
fn test_vote_validation() {
    let h = Harness::start();
    let vote = |origin: &str, voter: &str, referer| {
        h.post(
            "/_events/vote",
            json!({"origin": origin, "id": "q1", "voter": voter, "answer": "a"}),
            referer,
        )
    };

    let reply = vote("/intro/", "v1", Some("http://127.0.0.1/other/"));
    assert_eq!(reply.status, 403);
    assert_eq!(vote("/intro/", "", None).status, 400);
    assert_eq!(vote("intro", "v1", None).status, 400);
    assert_eq!(vote("/intro/", &"x".repeat(MAX_VOTE_FIELD + 1), None).status, 400);

    let reply = vote("/intro/index.html", "v1", Some("http://127.0.0.1/intro/"));
    assert_eq!(reply.status, 200);

    let conn = h.ctx.store.connect().unwrap();
    assert_eq!(
        polls::results(&conn, "/intro/", "q1").unwrap(),
        json!({"votes": 1, "answers": {"a": 1}})
    );
}

#[test]
fn test_watch_sub_and_vote() {
    let h = Harness::start();

    let mut stream = Stream::open(
        h.addr,
        json!({"add": [
            {"wid": 0, "req": {"name": "build"}},
            {"wid": 7, "req": {"name": "bogus"}},
        ]}),
    );
    let opened = stream.next_json();
    assert_eq!(opened["failed"], json!([7]));
    let sid = opened["sid"].as_str().unwrap().to_string();
    assert_eq!(stream.next_json(), json!({"wid": 0, "data": "1"}));

    let referer = Some("http://127.0.0.1/intro/");
    let poll = json!({"name": "poll", "origin": "/intro/", "id": "q1"});
    let reply = h.post(
        "/_events/sub",
        json!({"sid": sid, "add": [{"wid": 1, "req": poll}], "remove": [0]}),
        referer,
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json(), json!({"failed": []}));

    let reply = h.post(
        "/_events/vote",
        json!({"origin": "/intro/", "id": "q1", "voter": "v1", "answer": "b"}),
        referer,
    );
    assert_eq!(reply.status, 200);

    // The first tally may be coalesced away; the vote must arrive
    loop {
        let frame = stream.next_json();
        assert_eq!(frame["wid"], 1);
        if frame["data"]["votes"] == 1 {
            assert_eq!(frame["data"]["answers"], json!({"b": 1}));
            break;
        }
    }

    drop(stream);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.ctx.hub.watcher_count() > 0 {
        assert!(Instant::now() < deadline, "session not closed");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.ctx.hub.observable_count(), 0);
}
