//! Integration tests for afd-amg
//!
//! These tests start a real supervisor in a scratch work directory and
//! drive it through its FIFOs the way edit dialogs and `afdctl` do.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use afd_amg::afd_status::{AfdActive, AfdStatusMap};
use afd_amg::dir_check::DirCheckCommand;
use afd_amg::fsa::Fsa;
use afd_amg::host_list;
use afd_amg::supervisor::FD_WAIT_STEP;
use afd_amg::{AmgOptions, StopReason, Supervisor, SupervisorError};
use afd_config::testing::TestEnvironment;
use afd_config::HostDefaults;
use afd_ipc::client::{reread_dir_config, reread_host_config, send_amg_command, send_db_update};
use afd_ipc::{
    make_fifo, DbUpdateRequest, DirConfigResult, HostConfigResult, Verbosity, DC_NO, FD_CMD_FIFO,
    FD_WAITING, FSA_ABOUT_TO_CHANGE, PROC_ON, PROC_STOPPED, SHUTDOWN,
};
use filetime::FileTime;
use tokio::task::JoinHandle;

const H1: &str = "h1:1.2.3.4::::3:10:300:4096:10:-1:120:0:0:1:0:0:0:0:0:0:0\n";
const H2: &str = "h2:5.6.7.8::::2:10:60:8192:10:-1:120:0:0:1:0:0:0:0:0:0:0\n";

const DIR_CONFIG: &str = "\
[directory] /data/in
   [files]
   *
      [destination]
         [recipient]
         ftp://user:pw@h1/out
";

const REPLY_TIMEOUT: Duration = Duration::from_secs(20);

fn setup() -> TestEnvironment {
    let env = TestEnvironment::new().unwrap();
    env.write_afd_config("AMG_DIR_RESCAN_TIME 1\nMAX_SHUTDOWN_TIME 10\n")
        .unwrap();
    env.write_host_config(H1).unwrap();
    env.write_dir_config(DIR_CONFIG).unwrap();
    env
}

async fn spawn_amg(options: AmgOptions) -> JoinHandle<anyhow::Result<StopReason>> {
    let supervisor = Supervisor::start(options).await.unwrap();
    tokio::spawn(supervisor.run())
}

async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

async fn stop_amg(fifo_dir: &Path, handle: JoinHandle<anyhow::Result<StopReason>>) {
    send_amg_command(fifo_dir, SHUTDOWN).unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("AMG did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::Shutdown);
}

/// Push the mtime well past whatever AMG recorded.
fn touch_later(path: &Path) {
    let now = chrono::Utc::now().timestamp();
    filetime::set_file_mtime(path, FileTime::from_unix_time(now + 10, 0)).unwrap();
}

/// Pretend FD is up: mark it running in afd_status and hold its command
/// fifo open for reading.
fn fake_fd(env: &TestEnvironment) -> (AfdStatusMap, File) {
    env.work.create_layout().unwrap();
    let fifo = env.work.fifo_dir();
    let mut status = AfdStatusMap::create(&fifo).unwrap();
    status.status_mut().unwrap().fd = PROC_ON;
    let path = fifo.join(FD_CMD_FIFO);
    make_fifo(&path).unwrap();
    let fd_cmd = File::options().read(true).write(true).open(&path).unwrap();
    (status, fd_cmd)
}

fn aliases(fsa: &Fsa) -> Vec<String> {
    fsa.hosts()[..fsa.num_hosts()]
        .iter()
        .map(|h| h.alias())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_publishes_first_generation() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let supervisor = Supervisor::start(AmgOptions::new(env.work.clone()))
        .await
        .unwrap();

    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(1));
    let fsa = Fsa::attach_passive(&fifo, true, "test").unwrap();
    assert_eq!(fsa.num_hosts(), 1);
    let h1 = &fsa.hosts()[0];
    assert_eq!(h1.alias(), "h1");
    assert_eq!(h1.retry_interval, 300);
    assert_eq!(h1.block_size, 4096);

    // Rewritten with a preamble, same fields.
    let defaults = HostDefaults::default();
    let on_disk = host_list::read(&env.work.host_config(), &defaults).unwrap();
    let original = host_list::parse(H1, &defaults).unwrap();
    assert_eq!(on_disk.entries, original.entries);
    let text = std::fs::read_to_string(env.work.host_config()).unwrap();
    assert!(text.starts_with('#'));

    assert!(env.work.counter_file().exists());
    assert_eq!(supervisor.hosts().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reread_without_change() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    let dir = fifo.clone();
    let reply = tokio::task::spawn_blocking(move || {
        reread_host_config(&dir, Verbosity::Quiet, REPLY_TIMEOUT)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.result(), Some(HostConfigResult::NoChange));
    assert_eq!(reply.hc_warnings, 0);
    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(1));

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reread_with_added_host() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    let path = env.write_host_config(&format!("{}{}", H1, H2)).unwrap();
    touch_later(&path);

    let dir = fifo.clone();
    let reply = tokio::task::spawn_blocking(move || {
        reread_host_config(&dir, Verbosity::Verbose1, REPLY_TIMEOUT)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.result(), Some(HostConfigResult::DataChanged));

    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(2));
    let fsa = Fsa::attach_passive(&fifo, true, "test").unwrap();
    assert_eq!(aliases(&fsa), vec!["h1", "h2"]);
    assert_eq!(fsa.hosts()[1].block_size, 8192);
    // The old generation is gone.
    assert!(!afd_ipc::fsa_stat_file(&fifo, 1).exists());
    // Verbose requests leave a debug file for the caller.
    let debug_file = fifo.join(format!(
        "{}{}",
        afd_ipc::DB_UPDATE_REPLY_DEBUG_FILE,
        std::process::id()
    ));
    assert!(debug_file.exists());

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reread_dir_config_adds_hosts() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    let path = env
        .write_dir_config(&format!(
            "{}\n[directory] /data/more\n   [files]\n   *.txt\n      [destination]\n         [recipient]\n         sftp://u@h3/in\n",
            DIR_CONFIG
        ))
        .unwrap();
    touch_later(&path);

    let dir = fifo.clone();
    let reply = tokio::task::spawn_blocking(move || {
        reread_dir_config(&dir, Verbosity::Quiet, REPLY_TIMEOUT)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.hc_result, HostConfigResult::NoChange as i32);
    assert_eq!(reply.dc_result, DirConfigResult::Updated as i32);

    let fsa = Fsa::attach_passive(&fifo, true, "test").unwrap();
    assert_eq!(aliases(&fsa), vec!["h1", "h3"]);
    let text = std::fs::read_to_string(env.work.host_config()).unwrap();
    assert!(text.lines().any(|l| l.starts_with("h3:")));

    // A second request finds nothing new.
    let dir = fifo.clone();
    let again = tokio::task::spawn_blocking(move || {
        reread_dir_config(&dir, Verbosity::Quiet, REPLY_TIMEOUT)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(again.dc_result, DirConfigResult::NoChange as i32);

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_config_update_from_fsa() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    let mut fsa = Fsa::attach(&fifo, "test").unwrap();
    fsa.hosts_mut().unwrap()[0].retry_interval = 999;
    fsa.flush().unwrap();
    send_db_update(&fifo, DbUpdateRequest::HostConfigUpdate).unwrap();

    let path = env.work.host_config();
    let defaults = HostDefaults::default();
    let updated = wait_for(Duration::from_secs(5), || {
        host_list::read(&path, &defaults)
            .map(|p| p.entries.first().map(|e| e.retry_interval) == Some(999))
            .unwrap_or(false)
    })
    .await;
    assert!(updated);
    assert!(wait_for(Duration::from_secs(2), || fsa.header().host_config_counter >= 1).await);

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_keeps_counter_and_marks_stopped() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    let started = Instant::now();
    stop_amg(&fifo, handle).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let status = AfdStatusMap::attach(&fifo, Duration::from_secs(1)).unwrap();
    assert_eq!(status.status().amg, PROC_STOPPED);
    assert!(env.work.counter_file().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dir_check_is_restarted() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let options = AmgOptions::new(env.work.clone())
        .with_dir_check(DirCheckCommand::new("sleep").arg("30"));
    let handle = spawn_amg(options).await;

    let active = AfdActive::open(&fifo).unwrap();
    let first = active.pid(DC_NO).unwrap();
    assert!(first > 0);
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(first),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let restarted = wait_for(Duration::from_secs(6), || {
        active.pid(DC_NO).map(|p| p > 0 && p != first).unwrap_or(false)
    })
    .await;
    assert!(restarted);

    stop_amg(&fifo, handle).await;
    assert_eq!(active.pid(DC_NO).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_onetime_configs() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    env.write_etc("onetime/job.1", DIR_CONFIG).unwrap();
    env.write_etc("onetime/junk", "nothing to see here\n").unwrap();

    let spooled = env.work.onetime_spool_dir().join("job.1");
    assert!(wait_for(Duration::from_secs(6), || spooled.exists()).await);
    let junk = env.work.onetime_config_dir().join("junk");
    assert!(wait_for(Duration::from_secs(3), || !junk.exists()).await);
    assert!(!env.work.onetime_config_dir().join("job.1").exists());

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_host_config_is_recreated() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;

    std::fs::remove_file(env.work.host_config()).unwrap();
    let path = env.work.host_config();
    assert!(wait_for(Duration::from_secs(6), || path.exists()).await);
    let parsed = host_list::read(&path, &HostDefaults::default()).unwrap();
    assert_eq!(parsed.entries[0].alias, "h1");

    stop_amg(&fifo, handle).await;
}

#[tokio::test]
async fn test_missing_dir_config_is_fatal() {
    let env = TestEnvironment::new().unwrap();
    env.write_host_config(H1).unwrap();
    let err = afd_amg::run(AmgOptions::new(env.work.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Init(_)));
    assert_eq!(err.exit_code(), afd_amg::supervisor::INCORRECT);
}

#[tokio::test]
async fn test_hosts_from_dir_config_only() {
    let env = TestEnvironment::new().unwrap();
    env.write_dir_config(DIR_CONFIG).unwrap();
    let supervisor = Supervisor::start(AmgOptions::new(env.work.clone()))
        .await
        .unwrap();
    assert_eq!(supervisor.hosts().len(), 1);
    assert_eq!(supervisor.hosts()[0].alias, "h1");
    let text = std::fs::read_to_string(env.work.host_config()).unwrap();
    assert!(text.lines().any(|l| l.starts_with("h1:")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fsa_change_waits_for_fd() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let (status, mut fd_cmd) = fake_fd(&env);

    // FD answers every FSA_ABOUT_TO_CHANGE by raising FD_WAITING.
    let fd = std::thread::spawn(move || {
        let mut byte = [0u8; 1];
        for _ in 0..2 {
            fd_cmd.read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], FSA_ABOUT_TO_CHANGE);
            status.set_amg_jobs(FD_WAITING);
        }
    });

    let started = Instant::now();
    let handle = spawn_amg(AmgOptions::new(env.work.clone())).await;
    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(1));

    let path = env.write_host_config(&format!("{}{}", H1, H2)).unwrap();
    touch_later(&path);
    let dir = fifo.clone();
    let reply = tokio::task::spawn_blocking(move || {
        reread_host_config(&dir, Verbosity::Quiet, REPLY_TIMEOUT)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.result(), Some(HostConfigResult::DataChanged));
    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(2));
    // Both changes went ahead on the acknowledgement, long before the
    // full wait would have run out.
    assert!(started.elapsed() < FD_WAIT_STEP * afd_amg::supervisor::WAIT_LOOPS / 2);
    fd.join().unwrap();

    let status = AfdStatusMap::attach(&fifo, Duration::from_secs(1)).unwrap();
    assert_eq!(status.amg_jobs() & FD_WAITING, 0);

    stop_amg(&fifo, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fsa_change_without_fd_acknowledgement() {
    let env = setup();
    let fifo = env.work.fifo_dir();
    let (_status, mut fd_cmd) = fake_fd(&env);

    let mut options = AmgOptions::new(env.work.clone());
    options.fd_wait_loops = 3;
    let started = Instant::now();
    let supervisor = Supervisor::start(options).await.unwrap();
    assert!(started.elapsed() >= FD_WAIT_STEP * 3);

    let mut byte = [0u8; 1];
    fd_cmd.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], FSA_ABOUT_TO_CHANGE);
    assert_eq!(Fsa::current_id(&fifo).unwrap(), Some(1));
    assert_eq!(supervisor.hosts().len(), 1);
}
