//! End-to-end master/outstation scenarios over TCP loopback

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use voltage_dnp3::app::{self, AppControl};
use voltage_dnp3::segment::LinkChannel;
use voltage_dnp3::{
    ControlRelayOutputBlock, DatabaseControlHandler, Diagnostics, Dnp3Error, Dnp3Transport,
    EventClass, FilterLevel, FunctionCode, Iin, MasterConfig, MasterHandle, OutstationConfig,
    OutstationHandle, OutstationServer, Point, PointType, PointValue, SelectOperateError,
    SessionState, TcpTransport, TransportSettings,
};

fn outstation_points() -> Vec<Point> {
    vec![
        Point::binary_input(0, false),
        Point::binary_output(3, false),
        Point::binary_output(4, false),
        Point::analog_input(0, 1.5),
        Point::counter(0, 10),
    ]
}

async fn start_pair(config: MasterConfig) -> (OutstationHandle, MasterHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = OutstationServer::from_listener(
        listener,
        OutstationConfig::default().with_filter_level(FilterLevel::Debug),
    );
    let accept =
        tokio::spawn(async move { server.accept(outstation_points(), DatabaseControlHandler).await });

    let mut config = config.with_filter_level(FilterLevel::Debug);
    config.session.transport = TransportSettings::new("127.0.0.1", port);
    let master = MasterHandle::open(config).await.unwrap();
    let outstation = accept.await.unwrap().unwrap();
    (outstation, master)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_select_before_operate_latch_on() {
    let (outstation, master) = start_pair(MasterConfig::default()).await;

    master
        .select(3, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap();
    master
        .operate(3, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap();

    assert_eq!(
        master.points().read(PointType::BinaryOutput, 3).unwrap().value,
        PointValue::Binary(true)
    );
    assert_eq!(
        outstation.points().read(PointType::BinaryOutput, 3).unwrap().value,
        PointValue::Binary(true)
    );
    assert!(!master.last_iin().has_request_error());
}

#[tokio::test]
async fn test_operate_on_other_index_is_refused() {
    let (outstation, master) = start_pair(MasterConfig::default()).await;

    master
        .select(3, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap();
    let err = master
        .operate(4, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Dnp3Error::SelectOperate(SelectOperateError::Mismatch {
            selected_index: 3,
            operate_index: 4
        })
    ));

    assert!(!master.points().contains(PointType::BinaryOutput, 4));
    assert_eq!(
        outstation.points().read(PointType::BinaryOutput, 4).unwrap().value,
        PointValue::Binary(false)
    );
}

#[tokio::test]
async fn test_select_and_operate_with_concurrent_poll() {
    let (outstation, master) = start_pair(MasterConfig::default()).await;

    let sbo = tokio::spawn({
        let master = master.clone();
        async move {
            master
                .select_and_operate(3, ControlRelayOutputBlock::latch_on())
                .await
        }
    });
    tokio::task::yield_now().await;
    let poll = master.clone().integrity_poll().await;

    assert!(poll.is_ok());
    sbo.await.unwrap().unwrap();
    assert_eq!(
        outstation.points().read(PointType::BinaryOutput, 3).unwrap().value,
        PointValue::Binary(true)
    );
}

#[tokio::test]
async fn test_expired_select() {
    let config = MasterConfig::default().with_select_timeout_ms(100);
    let (_outstation, master) = start_pair(config).await;

    master
        .select(3, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;
    let err = master
        .operate(3, ControlRelayOutputBlock::latch_on())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Dnp3Error::SelectOperate(SelectOperateError::Expired)
    ));
}

#[tokio::test]
async fn test_integrity_poll_fills_master_database() {
    let (_outstation, master) = start_pair(MasterConfig::default()).await;

    let response = master.integrity_poll().await.unwrap();
    assert!(!response.iin.has_request_error());

    let points = master.points();
    assert_eq!(points.len(), outstation_points().len());
    assert_eq!(
        points.read(PointType::AnalogInput, 0).unwrap().value,
        PointValue::Analog(1.5)
    );
    assert_eq!(
        points.read(PointType::Counter, 0).unwrap().value,
        PointValue::Counter(10)
    );
}

#[tokio::test]
async fn test_unsolicited_event_reaches_master() {
    let (outstation, master) = start_pair(MasterConfig::default()).await;

    wait_until(|| master.last_iin().contains(Iin::DEVICE_RESTART)).await;
    master.enable_unsolicited(&[EventClass::Class1]).await.unwrap();
    outstation.update(Point::binary_input(0, true)).await.unwrap();

    let points = master.points().clone();
    wait_until(move || {
        points
            .read(PointType::BinaryInput, 0)
            .map(|p| p.value == PointValue::Binary(true))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_time_sync_and_restart_clear() {
    let (_outstation, master) = start_pair(MasterConfig::default()).await;

    master.sync_time().await.unwrap();
    master.clear_restart().await.unwrap();
    master.read_class(&[EventClass::Class2]).await.unwrap();
    assert!(!master.last_iin().contains(Iin::DEVICE_RESTART));
}

#[tokio::test]
async fn test_retry_exhaustion_keeps_session_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Ignores the first request and its two retries, answers everything after
    let responder = tokio::spawn(async move {
        let mut transport = TcpTransport::accept(&listener).await.unwrap();
        let mut channel = LinkChannel::new(1024, 1, false, 2048, &Diagnostics::default());
        let mut seen = 0;
        while let Ok(Some(bytes)) = transport.receive().await {
            for fragment in channel.receive(&bytes).fragments {
                let request = app::parse(&fragment).unwrap();
                seen += 1;
                if seen <= 3 {
                    continue;
                }
                let response = app::build_response(
                    FunctionCode::Response,
                    AppControl::single(request.control.seq),
                    Iin::default(),
                    &[],
                )
                .unwrap();
                channel.send(&mut transport, &response).await.unwrap();
            }
        }
        seen
    });

    let config = MasterConfig::new(TransportSettings::new("127.0.0.1", port))
        .with_retry_count(2)
        .with_response_timeout_ms(200);
    let master = MasterHandle::open(config).await.unwrap();

    let err = master.integrity_poll().await.unwrap_err();
    assert!(matches!(err, Dnp3Error::Timeout { attempts: 3 }));
    assert_eq!(master.state(), SessionState::Idle);

    master.read_class(&[EventClass::Class1]).await.unwrap();
    master.close().await.unwrap();
    assert_eq!(master.state(), SessionState::Closed);
    assert_eq!(responder.await.unwrap(), 4);
}

#[tokio::test]
async fn test_outstation_close_ends_master_session() {
    let (outstation, master) = start_pair(MasterConfig::default()).await;

    outstation.close().await.unwrap();
    let mut state = master.subscribe_state();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        master.integrity_poll().await,
        Err(Dnp3Error::ConnectionLost)
    ));
}

#[tokio::test]
async fn test_open_refused_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = MasterConfig::new(
        TransportSettings::new("127.0.0.1", port).with_connect_timeout(Duration::from_secs(1)),
    );
    let err = MasterHandle::open(config).await.unwrap_err();
    assert!(err.is_fatal());
}
