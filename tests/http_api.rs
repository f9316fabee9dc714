// CLASSIFICATION: COMMUNITY
// Filename: http_api.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-08-27

//! HTTP surface tests against a live broker on an ephemeral port.

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asmbroker::api::{self, Broker};
use asmbroker::cache::ResultCache;
use asmbroker::compile::{CompileEnv, Lane};
use asmbroker::config::Config;
use asmbroker::exec::sandbox::SandboxMode;
use asmbroker::registry::CompilerPool;
use asmbroker::types::CompilerDescriptor;
use asmbroker::workspace::WorkspaceAllocator;
use serial_test::serial;
use tempfile::TempDir;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

struct TestServer {
    _root: TempDir,
    pool: Arc<CompilerPool>,
    cache: Arc<ResultCache>,
    base: String,
}

fn start_server() -> TestServer {
    let root = TempDir::new().expect("tempdir");
    let cfg = Arc::new(Config {
        temp_dir: Some(root.path().to_path_buf()),
        sandbox_type: "none".into(),
        proxy_timeout_ms: 2_000,
        ..Default::default()
    });
    let cache = Arc::new(ResultCache::new(16 * 1024 * 1024));
    let env = CompileEnv {
        cfg: Arc::clone(&cfg),
        cache: Arc::clone(&cache),
        workspaces: Arc::new(
            WorkspaceAllocator::new(root.path().join("scratch")).expect("alloc"),
        ),
        lane: Arc::new(Lane::new(2)),
        sandbox: SandboxMode::None,
    };
    let pool = Arc::new(CompilerPool::new());
    let broker = Arc::new(Broker {
        cfg,
        env,
        pool: Arc::clone(&pool),
    });
    let port = free_port();
    let base = format!("http://127.0.0.1:{port}");
    std::thread::spawn(move || {
        let _ = api::serve(broker, "127.0.0.1", port);
    });
    // Wait for the listener to come up.
    for _ in 0..50 {
        if ureq::get(&format!("{base}/healthcheck"))
            .timeout(Duration::from_millis(200))
            .call()
            .is_ok()
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    TestServer {
        _root: root,
        pool,
        cache,
        base,
    }
}

fn fake_compiler(dir: &std::path::Path, id: &str) -> CompilerDescriptor {
    let script = dir.join(format!("{id}-cc"));
    let body = "#!/bin/sh\n\
                out=\"\"\n\
                while [ $# -gt 0 ]; do\n\
                  case \"$1\" in\n\
                    -o) out=\"$2\"; shift 2;;\n\
                    *) shift;;\n\
                  esac\n\
                done\n\
                printf 'f:\\n\\tmov eax, 42\\n\\tret\\n' > \"$out\"\n\
                exit 0\n";
    fs::write(&script, body).expect("write script");
    let mut perms = fs::metadata(&script).expect("stat").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).expect("chmod");
    CompilerDescriptor {
        id: id.into(),
        name: format!("{id} 1.0"),
        exe: Some(script),
        version: Some("g++ (fake) 1.0".into()),
        ..Default::default()
    }
}

#[test]
#[serial]
fn healthcheck_always_succeeds() {
    let server = start_server();
    let resp = ureq::get(&format!("{}/healthcheck", server.base))
        .call()
        .expect("healthcheck");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.into_string().unwrap(), "OK\n");
}

#[test]
#[serial]
fn compilers_list_negotiates_json_and_text() {
    let server = start_server();
    server.pool.publish(
        vec![
            CompilerDescriptor {
                id: "aa".into(),
                name: "Compiler AA".into(),
                exe: Some("/bin/true".into()),
                ..Default::default()
            },
            CompilerDescriptor {
                id: "longer-id".into(),
                name: "Compiler B".into(),
                exe: Some("/bin/true".into()),
                ..Default::default()
            },
        ],
        "{}".into(),
    );

    let json: serde_json::Value = ureq::get(&format!("{}/api/compilers", server.base))
        .call()
        .expect("compilers")
        .into_json()
        .expect("json");
    assert_eq!(json.as_array().map(|a| a.len()), Some(2));
    assert_eq!(json[0]["id"], "aa");
    assert!(json[0].get("exe").is_some());

    let text = ureq::get(&format!("{}/api/compilers", server.base))
        .set("Accept", "text/plain")
        .call()
        .expect("compilers text")
        .into_string()
        .expect("text");
    assert!(text.contains("aa        | Compiler AA"));
    assert!(text.contains("longer-id | Compiler B"));
}

#[test]
#[serial]
fn unknown_compiler_is_404() {
    let server = start_server();
    let err = ureq::post(&format!("{}/api/compiler/nope/compile", server.base))
        .set("Content-Type", "text/plain")
        .send_string("int f();");
    match err {
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, 404);
            assert!(resp.into_string().unwrap().contains("nope"));
        }
        other => panic!("expected 404, got {other:?}"),
    }
}

#[test]
#[serial]
fn json_envelope_compile_round_trip() {
    let server = start_server();
    let desc = fake_compiler(server._root.path(), "fake");
    server.pool.publish(vec![desc], "{}".into());

    let resp = ureq::post(&format!("{}/api/compiler/fake/compile", server.base))
        .set("Content-Type", "application/json")
        .send_string(
            r#"{"source":"int f(){return 42;}",
                "options":{"userArguments":"-O2","filters":{"labels":true}}}"#,
        )
        .expect("compile");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.into_json().expect("json");
    assert_eq!(body["okToCache"], true);
    assert_eq!(body["status"], 0);
    let asm = body["asm"].as_array().expect("asm");
    assert!(asm
        .iter()
        .any(|l| l["text"].as_str().unwrap_or("").contains("mov eax, 42")));
}

#[test]
#[serial]
fn text_form_returns_banner_output() {
    let server = start_server();
    let desc = fake_compiler(server._root.path(), "fake");
    server.pool.publish(vec![desc], "{}".into());

    let resp = ureq::post(&format!(
        "{}/api/compiler/fake/compile?options=-O2",
        server.base
    ))
    .set("Content-Type", "text/plain")
    .set("Accept", "text/plain")
    .send_string("int f(){return 42;}")
    .expect("compile");
    let text = resp.into_string().expect("text");
    assert!(text.starts_with("# Compilation provided by asmbroker"));
    assert!(text.contains("mov eax, 42"));
    assert!(text.contains("# Compiler exited with result code 0"));
}

#[test]
#[serial]
fn bare_binary_accept_serves_the_output_file() {
    let server = start_server();
    let mut desc = fake_compiler(server._root.path(), "fake");
    desc.supports_binary = true;
    server.pool.publish(vec![desc], "{}".into());

    let resp = ureq::post(&format!("{}/api/compiler/fake/compile", server.base))
        .set("Content-Type", "application/json")
        .set("Accept", "binary")
        .send_string(
            r#"{"source":"int main(){return 0;}",
                "options":{"filters":{"binary":true}}}"#,
        )
        .expect("compile");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.content_type(), "application/octet-stream");
    let body = resp.into_string().expect("body");
    assert!(body.contains("mov eax, 42"), "raw output file is served");
}

#[test]
#[serial]
fn forbidden_include_is_400_with_diagnostic() {
    let server = start_server();
    let desc = fake_compiler(server._root.path(), "fake");
    server.pool.publish(vec![desc], "{}".into());

    let outcome = ureq::post(&format!("{}/api/compiler/fake/compile", server.base))
        .set("Content-Type", "text/plain")
        .send_string("#include \"/etc/passwd\"\nint f();");
    match outcome {
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, 400);
            let body = resp.into_string().unwrap();
            assert!(body.contains("<stdin>:1:1: no absolute or relative includes please"));
        }
        other => panic!("expected 400, got {other:?}"),
    }
}

#[test]
#[serial]
fn client_options_snapshot_is_served() {
    let server = start_server();
    server
        .pool
        .publish(Vec::new(), r#"{"compilers":[],"filters":["intel"]}"#.into());
    let body: serde_json::Value = ureq::get(&format!("{}/client-options.json", server.base))
        .call()
        .expect("options")
        .into_json()
        .expect("json");
    assert_eq!(body["filters"][0], "intel");
}

#[test]
#[serial]
fn asm_doc_lookup() {
    let server = start_server();
    let body: serde_json::Value = ureq::get(&format!("{}/api/asm/mov", server.base))
        .call()
        .expect("asm doc")
        .into_json()
        .expect("json");
    assert_eq!(body["opcode"], "MOV");
    assert!(ureq::get(&format!("{}/api/asm/frobnicate", server.base))
        .call()
        .is_err());
}

#[test]
#[serial]
fn remote_descriptor_proxies_transparently() {
    let server = start_server();

    // Fake peer records the exact path and body it receives.
    let seen: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
    let peer_port = free_port();
    {
        let seen = Arc::clone(&seen);
        std::thread::spawn(move || {
            let peer = tiny_http::Server::http(("127.0.0.1", peer_port)).expect("peer bind");
            for mut request in peer.incoming_requests() {
                let mut body = String::new();
                use std::io::Read;
                let _ = request.as_reader().read_to_string(&mut body);
                *seen.lock().unwrap() = Some((request.url().to_string(), body));
                let _ = request.respond(
                    tiny_http::Response::from_string(r#"{"asm":[{"text":"peer asm"}]}"#),
                );
            }
        });
    }

    server.pool.publish(
        vec![CompilerDescriptor {
            id: "x".into(),
            name: "peer compiler".into(),
            remote: Some(format!("http://127.0.0.1:{peer_port}")),
            ..Default::default()
        }],
        "{}".into(),
    );
    std::thread::sleep(Duration::from_millis(50));

    let payload = r#"{"source":"int f();","options":{"userArguments":"-O1"}}"#;
    let resp = ureq::post(&format!("{}/api/compiler/x/compile", server.base))
        .set("Content-Type", "application/json")
        .send_string(payload)
        .expect("proxied compile");
    assert_eq!(resp.status(), 200);
    let body = resp.into_string().expect("body");
    assert!(body.contains("peer asm"));

    let recorded = seen.lock().unwrap().clone().expect("peer saw request");
    assert_eq!(recorded.0, "/api/compiler/x/compile");
    assert_eq!(recorded.1, payload);
    assert_eq!(server.cache.entry_count(), 0, "local pipeline not engaged");
}

#[test]
#[serial]
fn oversized_body_is_rejected() {
    let root = TempDir::new().expect("tempdir");
    let cfg = Arc::new(Config {
        temp_dir: Some(root.path().to_path_buf()),
        sandbox_type: "none".into(),
        body_parser_limit: 64,
        ..Default::default()
    });
    let cache = Arc::new(ResultCache::new(1024));
    let env = CompileEnv {
        cfg: Arc::clone(&cfg),
        cache,
        workspaces: Arc::new(
            WorkspaceAllocator::new(root.path().join("scratch")).expect("alloc"),
        ),
        lane: Arc::new(Lane::new(1)),
        sandbox: SandboxMode::None,
    };
    let pool = Arc::new(CompilerPool::new());
    pool.publish(vec![fake_compiler(root.path(), "fake")], "{}".into());
    let broker = Arc::new(Broker {
        cfg,
        env,
        pool,
    });
    let port = free_port();
    let base = format!("http://127.0.0.1:{port}");
    std::thread::spawn(move || {
        let _ = api::serve(broker, "127.0.0.1", port);
    });
    std::thread::sleep(Duration::from_millis(100));

    let big = "x".repeat(1024);
    let outcome = ureq::post(&format!("{base}/api/compiler/fake/compile"))
        .set("Content-Type", "text/plain")
        .send_string(&big);
    match outcome {
        Err(ureq::Error::Status(code, _)) => assert_eq!(code, 413),
        other => panic!("expected 413, got {other:?}"),
    }
}
