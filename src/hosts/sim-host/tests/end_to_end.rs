use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reabridge::codec::encode_request;
use reabridge::frame::{read_frame, write_frame};
use reabridge::rendezvous::{self, ACTIVATOR_KEY};
use reabridge::{
    Api, ApiSurface, Batch, BridgeError, Catalog, Client, ClientSettings, ErrorKind, Host,
    Project, Request, Take,
};
use reabridge_core::Config;
use serde_json::{json, Value};
use sim_host::{spawn, SimHost, SimServer, CLOSE_PROJECT_TAB, NATIVES};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> Config {
    let mut config = Config::default();
    config.bridge.bind_host = "127.0.0.1".to_string();
    config.bridge.server_port = 0;
    config.bootstrap.poll_attempts = 20;
    config.bootstrap.poll_interval_ms = 10;
    config
}

fn start(setup: impl FnOnce(&SimHost) + Send + 'static) -> (SimServer, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let server = spawn(config(), dir.path().to_path_buf(), setup).expect("sim host starts");
    (server, dir)
}

fn client(port: u16) -> Arc<Client> {
    let settings = ClientSettings::from_config("127.0.0.1", &config()).with_port(port);
    Arc::new(Client::new(settings))
}

fn api(client: &Arc<Client>) -> Api {
    Api::outside(client.clone(), Arc::new(Catalog::standard()))
}

/// Forwards one client connection to the agent and counts the request frames it carries.
fn counting_relay(agent_port: u16) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        let mut agent = TcpStream::connect(("127.0.0.1", agent_port)).unwrap();
        let mut replies_in = agent.try_clone().unwrap();
        let mut replies_out = client.try_clone().unwrap();
        thread::spawn(move || {
            let _ = io::copy(&mut replies_in, &mut replies_out);
        });
        while let Ok(Some(frame)) = read_frame(&mut client) {
            counter.fetch_add(1, Ordering::SeqCst);
            if write_frame(&mut agent, &frame).is_err() {
                break;
            }
        }
        let _ = agent.shutdown(Shutdown::Both);
    });
    (port, requests)
}

fn remote_kind(err: BridgeError) -> Option<ErrorKind> {
    match err {
        BridgeError::Remote(remote) => remote.kind(),
        other => panic!("expected a remote error, got {other}"),
    }
}

#[test]
fn greets_and_answers_native_calls() {
    let (server, _dir) = start(|_| {});
    let client = client(server.port());
    let api = api(&client);

    assert_eq!(api.call("GetAppVersion", vec![]).unwrap(), json!("7.0/sim"));
    let peer = client.peer_address().expect("connected after the first call");
    assert!(peer.starts_with("('127.0.0.1', "), "greeting was {peer}");
}

#[test]
fn unknown_function_comes_back_as_a_name_error() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));

    let err = api.call("NonExistentApi", vec![]).unwrap_err();
    let BridgeError::Remote(remote) = err else {
        panic!("expected a remote error");
    };
    assert_eq!(remote.summary(), "NameError: NonExistentApi");
    assert!(remote.traceback().starts_with("Traceback (most recent call last):"));
}

#[test]
fn surface_rejects_unknown_names_before_connecting() {
    let (server, _dir) = start(|_| {});
    let client = client(server.port());
    let surface: ApiSurface = NATIVES.iter().map(|name| name.to_string()).collect();
    let api = api(&client).with_surface(Arc::new(surface));

    let err = api.call("NonExistentApi", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameError);
    assert!(!client.is_connected());
}

#[test]
fn hold_serves_a_thousand_calls_in_one_session() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));

    let positions = api
        .hold(|api| {
            (0..1000)
                .map(|_| api.call("GetCursorPosition", vec![]))
                .collect::<Result<Vec<Value>, _>>()
        })
        .unwrap();
    assert_eq!(positions.len(), 1000);
    assert!(positions.iter().all(|position| position == &json!(0.0)));

    // The agent serves normally again after the release.
    assert_eq!(api.call("GetAppVersion", vec![]).unwrap(), json!("7.0/sim"));
}

#[test]
fn project_tempo_reads_and_writes_in_the_host() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));

    let project = Project::current(&api).unwrap();
    assert!(project.handle().starts_with("(ReaProject*)0x"));
    assert_eq!(project.bpm(&api).unwrap(), 120.0);

    project.set_bpm(&api, 90.0).unwrap();
    assert_eq!(project.bpm(&api).unwrap(), 90.0);

    let err = project.set_bpm(&api, -1.0).unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::ValueError));
    let err = project.delete_bpm(&api).unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::AttributeError));
}

#[test]
fn markers_and_cursor() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));
    let project = Project::current(&api).unwrap();

    assert_eq!(project.add_marker(&api, 1.5, "verse").unwrap(), 1);
    assert_eq!(project.add_marker(&api, 9.0, "chorus").unwrap(), 2);

    api.call("SetEditCurPos2", vec![json!(project.handle()), json!(4.0), json!(true), json!(false)])
        .unwrap();
    assert_eq!(project.cursor_position(&api).unwrap(), 4.0);
}

#[test]
fn map_converts_times_to_ticks_in_one_request() {
    let (server, _dir) = start(|host| {
        let project = host.current_project();
        host.add_item(&project, true);
    });
    let (relay_port, requests) = counting_relay(server.port());
    let api = api(&client(relay_port));
    let project = Project::current(&api).unwrap();
    let take = Take::selected(&api, &project).unwrap().expect("selected take");

    let before = requests.load(Ordering::SeqCst);
    let ticks = take.times_to_ppq(&api, &[0.0, 1.0, 2.0]).unwrap();
    assert_eq!(ticks, vec![0.0, 960.0, 1920.0]);
    assert_eq!(requests.load(Ordering::SeqCst) - before, 1);
    assert_eq!(take.time_to_ppq(&api, 0.5).unwrap(), 480.0);
}

#[test]
fn no_selected_item_means_no_take() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));
    let project = Project::current(&api).unwrap();
    assert_eq!(Take::selected(&api, &project).unwrap(), None);
}

#[test]
fn batch_runs_a_loop_inside_the_host() {
    let (server, _dir) = start(|host| {
        let project = host.current_project();
        host.add_item(&project, true);
    });
    let api = api(&client(server.port()));
    let project = Project::current(&api).unwrap();
    let take = Take::selected(&api, &project).unwrap().expect("selected take");

    let batch = Batch::new(
        "
        ticks = []
        for t in times:
            append(ticks, MIDI_GetPPQPosFromProjTime(take, t))
        count = len(ticks)
        ",
    )
    .input("take", take.handle())
    .input("times", json!([0.25, 0.5]))
    .outputs(&["ticks", "count"]);

    assert_eq!(
        api.batch(&batch).unwrap(),
        vec![json!([240.0, 480.0]), json!(2)]
    );
}

#[test]
fn closed_projects_become_undefined_wrappers() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));
    let project = Project::current(&api).unwrap();
    assert!(project.is_valid(&api).unwrap());

    api.call("Main_OnCommand", vec![json!(CLOSE_PROJECT_TAB), json!(0)])
        .unwrap();

    assert!(!project.is_valid(&api).unwrap());
    let err = project.bpm(&api).unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::UndefinedWrapper));
    assert_ne!(Project::current(&api).unwrap(), project);
}

#[test]
fn client_closing_mid_call_leaves_the_agent_serving() {
    let (server, _dir) = start(|_| {});
    let api = api(&client(server.port()));
    let project = Project::current(&api).unwrap();

    let mut abandoned = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    read_frame(&mut abandoned).unwrap().expect("greeting");
    let request = Request::named(
        "AddProjectMarker",
        vec![
            json!(project.handle()),
            json!(false),
            json!(0.5),
            json!(0.0),
            json!("gone"),
            json!(-1),
            json!(0),
        ],
    );
    write_frame(&mut abandoned, &encode_request(&request).unwrap()).unwrap();
    drop(abandoned);

    // The abandoned call still runs; its effect stays in the host.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = api
            .call("CountProjectMarkers", vec![json!(project.handle())])
            .unwrap();
        if counts == json!([1, 1, 0]) {
            break;
        }
        assert!(Instant::now() < deadline, "abandoned request never ran");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(project.add_marker(&api, 1.0, "after").unwrap(), 2);
}

#[test]
fn garbage_length_header_leaves_the_agent_serving() {
    let (server, _dir) = start(|_| {});
    let mut garbage = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    read_frame(&mut garbage).unwrap().expect("greeting");
    io::Write::write_all(&mut garbage, &u64::MAX.to_le_bytes()).unwrap();

    let api = api(&client(server.port()));
    assert_eq!(api.call("GetAppVersion", vec![]).unwrap(), json!("7.0/sim"));
    drop(garbage);
    assert_eq!(api.call("GetAppVersion", vec![]).unwrap(), json!("7.0/sim"));
}

#[test]
fn stopping_the_host_disconnects_the_client() {
    let (mut server, _dir) = start(|_| {});
    let client = client(server.port());
    let api = api(&client);
    api.call("GetAppVersion", vec![]).unwrap();

    server.stop();

    let err = api.call("GetAppVersion", vec![]).unwrap_err();
    assert!(matches!(err, BridgeError::Disconnected { .. }), "got {err}");
    assert!(!client.is_connected());
}

#[test]
fn enabling_the_bridge_edits_the_host_config() {
    let dir = tempfile::tempdir().unwrap();
    let host = SimHost::new(dir.path());
    let config = config();

    let enabled = rendezvous::enable_bridge(&host, &config.bridge, "reabridge_agent.lua").unwrap();
    assert!(enabled.restart_required);
    assert_eq!(
        host.ext_state_get(&config.bridge.section, ACTIVATOR_KEY),
        Some(enabled.action_token.clone())
    );
    assert!(host.is_persisted(&config.bridge.section, ACTIVATOR_KEY));

    let ini = std::fs::read_to_string(dir.path().join("reaper.ini")).unwrap();
    assert!(ini.contains("csurf_0=HTTP 0 2307 '' 'index.html' 0 ''"));

    // A second enable finds the interface already installed.
    let again = rendezvous::enable_bridge(&host, &config.bridge, "reabridge_agent.lua").unwrap();
    assert!(!again.restart_required);
    assert_eq!(again.action_token, enabled.action_token);

    assert!(rendezvous::disable_bridge(&host, &config.bridge).unwrap());
    assert_eq!(host.ext_state_get(&config.bridge.section, ACTIVATOR_KEY), None);
}

fn bootstrapping_client(web: &MockServer) -> Arc<Client> {
    let mut settings = ClientSettings::from_config("127.0.0.1", &config());
    settings.web_interface_port = web.address().port();
    Arc::new(Client::new(settings))
}

fn port_reply(port: Option<u16>) -> ResponseTemplate {
    let value = port.map(|port| port.to_string()).unwrap_or_default();
    ResponseTemplate::new(200).set_body_string(format!("reapy\tserver_port\t{value}\n"))
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstraps_through_the_published_port() {
    let (server, _dir) = start(|_| {});
    let web = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_/GET/EXTSTATE/reapy/server_port"))
        .respond_with(port_reply(Some(server.port())))
        .mount(&web)
        .await;

    let client = bootstrapping_client(&web);
    let version = tokio::task::spawn_blocking(move || api(&client).call("GetAppVersion", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version, json!("7.0/sim"));
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_launches_the_agent_when_no_port_is_published() {
    let (server, _dir) = start(|_| {});
    let web = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_/GET/EXTSTATE/reapy/server_port"))
        .respond_with(port_reply(None))
        .up_to_n_times(1)
        .mount(&web)
        .await;
    Mock::given(method("GET"))
        .and(path("/_/GET/EXTSTATE/reapy/activate_reapy_server"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("reapy\tactivate_reapy_server\t_RS7\n"),
        )
        .mount(&web)
        .await;
    Mock::given(method("GET"))
        .and(path("/_/_RS7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&web)
        .await;
    Mock::given(method("GET"))
        .and(path("/_/GET/EXTSTATE/reapy/server_port"))
        .respond_with(port_reply(Some(server.port())))
        .mount(&web)
        .await;

    let client = bootstrapping_client(&web);
    let version = tokio::task::spawn_blocking(move || api(&client).call("GetAppVersion", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version, json!("7.0/sim"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_published_port_fails_with_a_hint() {
    let stale = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stale_port = stale.local_addr().unwrap().port();
    drop(stale);

    let web = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_/GET/EXTSTATE/reapy/server_port"))
        .respond_with(port_reply(Some(stale_port)))
        .mount(&web)
        .await;

    let client = bootstrapping_client(&web);
    let err = tokio::task::spawn_blocking(move || api(&client).call("GetAppVersion", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("server_port may be stale"), "got {err}");
}
