//! Session lifecycle tests against the in-memory driver.

use spdk_nvme::backend::sim::{SimDriver, SimFaults, SimNamespace};
use spdk_nvme::{DeviceSession, Error, ErrorKind, IoRequest, Result, SessionOptions, TransportId};

const ADDR: &str = "0000:01:00.0";
const TRID: &str = "trtype=PCIE traddr=0000:01:00.0";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn one_controller() -> SimDriver {
    let driver = SimDriver::new();
    driver
        .add_controller(ADDR, [SimNamespace::new(1_000_000, 512)])
        .unwrap();
    driver
}

fn initialize(driver: &SimDriver) -> Result<DeviceSession<SimDriver>> {
    DeviceSession::initialize(driver.clone(), TRID, SessionOptions::default())
}

#[test]
fn test_initialize_and_read() -> Result<()> {
    init_logger();
    let driver = one_controller();
    let mut session = initialize(&driver)?;

    assert!(session.is_attached());
    assert_eq!(session.namespace_size(), 1_000_000);
    assert_eq!(session.sector_size(), 512);
    assert_eq!(session.transport_id().map(|t| t.address()), Some(ADDR));
    assert_eq!(driver.live_controllers(), 1);
    assert_eq!(driver.live_qpairs(), 1);

    let id = session.submit(&IoRequest::read(0, 8, 4096), None)?;
    let done = session.wait(id)?;
    assert_eq!(done.id, id);
    assert!(done.is_success());
    assert_eq!(done.buffer().len(), 4096);
    assert!(done.buffer().is_aligned_to(4096));
    Ok(())
}

#[test]
fn test_short_pci_address_is_normalized() -> Result<()> {
    init_logger();
    let driver = one_controller();
    let session = DeviceSession::initialize(
        driver.clone(),
        "trtype:pcie traddr:01:00.0",
        SessionOptions::default(),
    )?;
    assert!(session.is_attached());
    assert_eq!(session.transport_id().map(|t| t.address()), Some(ADDR));
    Ok(())
}

#[test]
fn test_bad_transport_id_acquires_nothing() {
    init_logger();
    let driver = one_controller();

    for trid in [
        "",
        "traddr=0000:01:00.0",
        "trtype=PCIE",
        "trtype=PCIE traddr=zz:00.0",
        "trtype=PCIE traddr=0000:01:00.0 subnqn=foo",
        "trtype=BOGUS traddr=0000:01:00.0",
    ] {
        let err = DeviceSession::initialize(driver.clone(), trid, SessionOptions::default())
            .expect_err(trid);
        assert_eq!(err.kind(), ErrorKind::Configuration, "{trid}: {err}");
    }

    let err = DeviceSession::initialize(
        driver.clone(),
        "trtype=RDMA traddr=192.168.1.10",
        SessionOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedTransport(_)));

    assert!(driver.env_opts().is_none());
    assert_eq!(driver.live_controllers(), 0);
    assert_eq!(driver.live_qpairs(), 0);
}

#[test]
fn test_env_init_failure() {
    init_logger();
    let driver = one_controller();
    driver.set_faults(SimFaults {
        env_init_rc: Some(-12),
        ..Default::default()
    });

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::EnvInit(_)));
    assert_eq!(err.kind(), ErrorKind::Environment);
    assert_eq!(driver.live_controllers(), 0);
}

#[test]
fn test_probe_failure() {
    init_logger();
    let driver = one_controller();
    driver.set_faults(SimFaults {
        probe_rc: Some(-19),
        ..Default::default()
    });

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::ProbeFailed(-19)));
    assert_eq!(err.kind(), ErrorKind::Discovery);
}

#[test]
fn test_no_controller_at_address() {
    init_logger();
    let driver = SimDriver::new();
    driver
        .add_controller("0000:02:00.0", [SimNamespace::new(1024, 512)])
        .unwrap();

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::ControllerNotFound));
    assert_eq!(driver.live_controllers(), 0);
}

#[test]
fn test_inactive_namespace_releases_controller() {
    init_logger();
    let driver = SimDriver::new();
    driver
        .add_controller(ADDR, [SimNamespace::new(1024, 512).inactive()])
        .unwrap();

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::NamespaceInactive(1)));
    assert_eq!(err.kind(), ErrorKind::Attach);
    assert_eq!(driver.live_controllers(), 0);
    assert_eq!(driver.live_qpairs(), 0);
}

#[test]
fn test_missing_namespace() {
    init_logger();
    let driver = SimDriver::new();
    driver
        .add_controller(ADDR, Vec::<SimNamespace>::new())
        .unwrap();

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::NamespaceNotFound(1)));
    assert_eq!(driver.live_controllers(), 0);
}

#[test]
fn test_zero_geometry_rejected() {
    init_logger();
    let driver = SimDriver::new();
    driver
        .add_controller(ADDR, [SimNamespace::new(0, 512)])
        .unwrap();

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::InvalidGeometry { nsid: 1, num_sectors: 0, .. }));
    assert_eq!(driver.live_controllers(), 0);
}

#[test]
fn test_qpair_alloc_failure_releases_controller() {
    init_logger();
    let driver = one_controller();
    driver.set_faults(SimFaults {
        qpair_alloc: true,
        ..Default::default()
    });

    let err = initialize(&driver).unwrap_err();
    assert!(matches!(err, Error::QpairAlloc));
    assert_eq!(driver.live_controllers(), 0);
    assert_eq!(driver.live_qpairs(), 0);
}

#[test]
fn test_failed_controller_followed_by_good_one() -> Result<()> {
    init_logger();
    let driver = SimDriver::new();
    driver.add_controller(ADDR, [SimNamespace::new(1024, 512).inactive()])?;
    let good = driver.add_controller(ADDR, [SimNamespace::new(2048, 4096)])?;

    let session = initialize(&driver)?;
    assert_eq!(session.controller(), Some(good));
    assert_eq!(session.namespace_size(), 2048);
    assert_eq!(session.sector_size(), 4096);
    assert_eq!(driver.live_controllers(), 1);
    Ok(())
}

#[test]
fn test_qpair_doorbell_delay_disabled() -> Result<()> {
    init_logger();
    let driver = one_controller();
    let opts = SessionOptions::builder()
        .io_queue_size(128)
        .io_queue_requests(1024)
        .build();
    let session = DeviceSession::initialize(driver.clone(), TRID, opts)?;

    let qpair = session.qpair().expect("qpair");
    let qpair_opts = driver.qpair_opts(qpair).expect("qpair opts");
    assert!(!qpair_opts.delay_pcie_doorbell);
    assert_eq!(qpair_opts.io_queue_size, Some(128));
    assert_eq!(qpair_opts.io_queue_requests, Some(1024));
    Ok(())
}

#[test]
fn test_controller_and_env_options_applied() -> Result<()> {
    init_logger();
    let driver = one_controller();
    let opts = SessionOptions::builder()
        .name("session_test")
        .mem_size_mb(256)
        .no_huge(true)
        .num_io_queues(4)
        .keep_alive_timeout_ms(0)
        .build();
    let session = DeviceSession::initialize(driver.clone(), TRID, opts)?;

    let env = driver.env_opts().expect("env initialized");
    assert_eq!(env.name, "session_test");
    assert_eq!(env.mem_size_mb, Some(256));
    assert!(env.no_huge);

    let ctrlr = session.controller().expect("controller");
    let ctrlr_opts = driver.controller_opts(ctrlr).expect("ctrlr opts");
    assert_eq!(ctrlr_opts.num_io_queues, Some(4));
    assert_eq!(ctrlr_opts.keep_alive_timeout_ms, Some(0));
    // Unset fields keep the driver defaults.
    assert_eq!(ctrlr_opts.admin_queue_size, Some(32));
    assert_eq!(session.controller_opts(), Some(&ctrlr_opts));
    Ok(())
}

#[test]
fn test_duplicate_attach_keeps_first_qpair() -> Result<()> {
    init_logger();
    let driver = SimDriver::new();
    let first = driver.add_controller(ADDR, [SimNamespace::new(1024, 512)])?;
    driver.add_controller(ADDR, [SimNamespace::new(4096, 4096)])?;

    let mut session = initialize(&driver)?;
    let qpair = session.qpair();
    assert_eq!(session.controller(), Some(first));
    assert_eq!(session.namespace_size(), 1024);
    // The surplus controller was detached.
    assert_eq!(driver.live_controllers(), 1);
    assert_eq!(driver.live_qpairs(), 1);

    let extra = driver.add_controller(ADDR, [SimNamespace::new(8, 512)])?;
    let trid = TransportId::pcie(ADDR)?;
    let err = session
        .attach(&trid, extra, &Default::default())
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyAttached));
    assert_eq!(session.qpair(), qpair);
    assert_eq!(session.controller(), Some(first));
    assert_eq!(session.namespace_size(), 1024);
    assert_eq!(driver.live_qpairs(), 1);
    Ok(())
}

#[test]
fn test_teardown_unattached_session() {
    init_logger();
    let driver = SimDriver::new();
    let mut session = DeviceSession::new(driver.clone(), SessionOptions::default());
    assert!(!session.is_attached());
    session.teardown();
    session.teardown();
    assert_eq!(driver.live_controllers(), 0);
}

#[test]
fn test_teardown_is_idempotent() -> Result<()> {
    init_logger();
    let driver = one_controller();
    let mut session = initialize(&driver)?;

    session.teardown();
    assert!(!session.is_attached());
    assert!(session.controller().is_none());
    assert!(session.namespace().is_none());
    assert!(session.qpair().is_none());
    assert_eq!(session.namespace_size(), 0);
    assert_eq!(session.sector_size(), 0);
    assert_eq!(driver.live_controllers(), 0);
    assert_eq!(driver.live_qpairs(), 0);

    session.teardown();
    assert_eq!(driver.live_controllers(), 0);

    let err = session.submit(&IoRequest::read(0, 1, 512), None).unwrap_err();
    assert!(matches!(err, Error::NotAttached));
    Ok(())
}

#[test]
fn test_drop_releases_resources() -> Result<()> {
    init_logger();
    let driver = one_controller();
    {
        let _session = initialize(&driver)?;
        assert_eq!(driver.live_controllers(), 1);
    }
    assert_eq!(driver.live_controllers(), 0);
    assert_eq!(driver.live_qpairs(), 0);

    // The controller can be attached again afterwards.
    let session = initialize(&driver)?;
    assert!(session.is_attached());
    Ok(())
}

#[test]
fn test_failed_attach_leaves_no_namespace() -> Result<()> {
    init_logger();
    let driver = SimDriver::new();
    let a = driver.add_controller(ADDR, [SimNamespace::new(1024, 512)])?;
    let b = driver.add_controller(ADDR, Vec::<SimNamespace>::new())?;
    let trid = TransportId::pcie(ADDR)?;
    let mut session = DeviceSession::new(driver.clone(), SessionOptions::default());

    driver.set_faults(SimFaults {
        qpair_alloc: true,
        ..Default::default()
    });
    let err = session.attach(&trid, a, &Default::default()).unwrap_err();
    assert!(matches!(err, Error::QpairAlloc));
    assert_eq!(session.controller(), Some(a));
    assert!(session.namespace().is_none());
    assert_eq!(session.namespace_size(), 0);
    assert_eq!(session.sector_size(), 0);

    driver.set_faults(SimFaults::default());
    let err = session.attach(&trid, b, &Default::default()).unwrap_err();
    assert!(matches!(err, Error::NamespaceNotFound(1)));
    assert_eq!(session.controller(), Some(b));
    assert!(session.namespace().is_none());
    assert_eq!(session.namespace_size(), 0);
    assert_eq!(session.sector_size(), 0);
    assert!(!session.is_attached());
    Ok(())
}

#[test]
fn test_invalid_dma_alignment_is_a_configuration_error() {
    init_logger();
    let driver = one_controller();
    let opts = SessionOptions {
        dma_alignment: 3000,
        ..Default::default()
    };

    let err = DeviceSession::initialize(driver.clone(), TRID, opts).unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(driver.env_opts().is_none());
    assert_eq!(driver.live_controllers(), 0);
}
