//! Outstation session
//!
//! Serves one master over one connection. The session task owns the point
//! database writer, the event buffer and the select record; handles feed it
//! point updates through a command channel.
//!
//! # Request handling
//!
//! | Function | Behavior |
//! |----------|----------|
//! | READ | Class 0 and static ranges from the database, class 1-3 from the event buffer |
//! | WRITE | g50v1 sets the clock (clears NEED_TIME), g80v1 index 7 clears DEVICE_RESTART |
//! | SELECT | Asks the [`ControlHandler`], arms the select record on success |
//! | OPERATE | Requires seq = select seq + 1 and identical object bytes inside the window |
//! | DIRECT_OPERATE(_NO_ACK) | Executes immediately |
//! | ENABLE/DISABLE_UNSOLICITED | Per class 1-3 |
//! | DELAY_MEASURE | g52v2 with the processing time |
//!
//! Responses that carry events or span several fragments set CON; events
//! leave the buffer only once the master confirms them.
//!
//! A request repeated with the same sequence number and bytes is answered
//! from the cached response without being executed again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::app::{self, AppControl, FragmentBuilder, FunctionCode, Iin, ParsedFragment};
use crate::constants::{REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};
use crate::control::{CommandStatus, OutputCommand};
use crate::database::{PointDatabase, PointReader};
use crate::error::{Dnp3Error, Dnp3Result};
use crate::logging::{Diagnostics, FilterLevel};
use crate::object::{Encoding, HeaderRange, ObjectBlock, ObjectValue, Variation};
use crate::point::{DnpTime, EventClass, Point, PointType};
use crate::runtime;
use crate::segment::LinkChannel;
use crate::session::{Sequence, SessionConfig, SessionEvent, SessionState, StateMachine};
use crate::transport::{Dnp3Transport, TcpTransport, TransportSettings};

const COMMAND_QUEUE_SIZE: usize = 64;

/// Bytes an object header with a 16-bit range or count can take
const MAX_OBJECT_HEADER_LEN: usize = 7;

// ============================================================================
// Configuration
// ============================================================================

/// Outstation session configuration
#[derive(Debug, Clone)]
pub struct OutstationConfig {
    pub session: SessionConfig,
    /// How long a SELECT stays armed
    pub select_timeout_ms: u64,
    /// Re-sends of an unconfirmed unsolicited response before giving up
    pub unsolicited_retry_count: u32,
    /// When false, no unsolicited responses are sent at all
    pub allow_unsolicited: bool,
    /// Commands accepted in one SELECT/OPERATE; more yields TOO_MANY_OPS
    pub max_controls_per_request: usize,
    pub event_buffer_size: usize,
    /// Class assigned to events of each input type
    pub event_classes: BTreeMap<PointType, EventClass>,
}

impl OutstationConfig {
    pub fn new(transport: TransportSettings) -> Self {
        Self::from(SessionConfig::outstation(transport))
    }

    pub fn with_select_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.select_timeout_ms = timeout_ms;
        self
    }

    pub fn with_filter_level(mut self, level: FilterLevel) -> Self {
        self.session.filter_level = level;
        self
    }

    pub fn with_unsolicited_retry_count(mut self, retries: u32) -> Self {
        self.unsolicited_retry_count = retries;
        self
    }

    pub fn with_allow_unsolicited(mut self, allow: bool) -> Self {
        self.allow_unsolicited = allow;
        self
    }

    pub fn with_max_controls_per_request(mut self, max: usize) -> Self {
        self.max_controls_per_request = max;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_event_class(mut self, point_type: PointType, class: EventClass) -> Self {
        self.event_classes.insert(point_type, class);
        self
    }

    pub fn select_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.select_timeout_ms)
    }

    pub fn validate(&self) -> Dnp3Result<()> {
        self.session.validate()?;
        if self.select_timeout_ms == 0 {
            return Err(Dnp3Error::configuration("Select timeout must be non-zero"));
        }
        if self.max_controls_per_request == 0 {
            return Err(Dnp3Error::configuration(
                "max_controls_per_request must be at least 1",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(Dnp3Error::configuration("Event buffer size must be at least 1"));
        }
        Ok(())
    }
}

impl From<SessionConfig> for OutstationConfig {
    fn from(session: SessionConfig) -> Self {
        let event_classes = BTreeMap::from([
            (PointType::BinaryInput, EventClass::Class1),
            (PointType::AnalogInput, EventClass::Class2),
            (PointType::Counter, EventClass::Class3),
        ]);
        Self {
            session,
            select_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            unsolicited_retry_count: crate::DEFAULT_RETRY_COUNT,
            allow_unsolicited: true,
            max_controls_per_request: 16,
            event_buffer_size: 100,
            event_classes,
        }
    }
}

impl Default for OutstationConfig {
    fn default() -> Self {
        Self::new(TransportSettings::new("0.0.0.0", crate::constants::DEFAULT_DNP3_PORT))
    }
}

// ============================================================================
// Control handler
// ============================================================================

/// Decides whether output commands are accepted.
///
/// Called from the session task; implementations must not block.
pub trait ControlHandler: Send + 'static {
    fn select(&mut self, index: u16, command: &OutputCommand, points: &PointReader) -> CommandStatus;

    fn operate(&mut self, index: u16, command: &OutputCommand, points: &PointReader) -> CommandStatus;
}

/// Accepts any command that targets an output point present in the database
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseControlHandler;

impl DatabaseControlHandler {
    fn check(index: u16, command: &OutputCommand, points: &PointReader) -> CommandStatus {
        if !points.contains(command.point_type(), index) {
            return CommandStatus::NotSupported;
        }
        match command.commanded_value() {
            Some(_) => CommandStatus::Success,
            None => CommandStatus::NotSupported,
        }
    }
}

impl ControlHandler for DatabaseControlHandler {
    fn select(&mut self, index: u16, command: &OutputCommand, points: &PointReader) -> CommandStatus {
        Self::check(index, command, points)
    }

    fn operate(&mut self, index: u16, command: &OutputCommand, points: &PointReader) -> CommandStatus {
        Self::check(index, command, points)
    }
}

// ============================================================================
// Event buffer
// ============================================================================

/// A recorded change of an input point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub id: u64,
    pub class: EventClass,
    pub point: Point,
}

#[derive(Debug)]
struct BufferedEvent {
    event: Event,
    in_flight: bool,
}

/// Bounded event queue.
///
/// Events handed out by [`EventBuffer::select`] stay in the buffer, marked
/// in flight, until [`EventBuffer::confirm`] removes them or
/// [`EventBuffer::release`] makes them reportable again. When full, the
/// oldest event is dropped and the overflow flag is raised.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<BufferedEvent>,
    capacity: usize,
    overflow: bool,
    next_id: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            overflow: false,
            next_id: 0,
        }
    }

    pub fn push(&mut self, class: EventClass, point: Point) -> u64 {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.overflow = true;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.events.push_back(BufferedEvent {
            event: Event { id, class, point },
            in_flight: false,
        });
        id
    }

    /// Mark matching unreported events in flight and return them, oldest first
    pub fn select(&mut self, filter: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.events
            .iter_mut()
            .filter(|e| !e.in_flight && filter(&e.event))
            .map(|e| {
                e.in_flight = true;
                e.event
            })
            .collect()
    }

    pub fn confirm(&mut self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.events.retain(|e| !ids.contains(&e.event.id));
        if self.events.len() < self.capacity {
            self.overflow = false;
        }
    }

    pub fn release(&mut self, ids: &[u64]) {
        for buffered in self.events.iter_mut() {
            if ids.contains(&buffered.event.id) {
                buffered.in_flight = false;
            }
        }
    }

    pub fn has_unreported(&self, class: EventClass) -> bool {
        self.events
            .iter()
            .any(|e| !e.in_flight && e.event.class == class)
    }

    pub fn contains_class(&self, class: EventClass) -> bool {
        self.events.iter().any(|e| e.event.class == class)
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn class_index(class: EventClass) -> usize {
    match class {
        EventClass::Class1 => 0,
        EventClass::Class2 => 1,
        EventClass::Class3 => 2,
    }
}

fn class_bit(class: EventClass) -> u16 {
    match class {
        EventClass::Class1 => Iin::CLASS1_EVENTS,
        EventClass::Class2 => Iin::CLASS2_EVENTS,
        EventClass::Class3 => Iin::CLASS3_EVENTS,
    }
}

// ============================================================================
// Handle and listener
// ============================================================================

#[derive(Debug)]
enum OutstationCommand {
    Update(Vec<Point>, oneshot::Sender<usize>),
    SetIin { bit: u16, set: bool },
    Close(oneshot::Sender<()>),
}

/// Handle to a running outstation session
#[derive(Debug, Clone)]
pub struct OutstationHandle {
    commands: mpsc::Sender<OutstationCommand>,
    state: watch::Receiver<SessionState>,
    points: PointReader,
    diagnostics: Diagnostics,
}

impl OutstationHandle {
    /// Serve a master over an already connected transport.
    pub fn spawn<T, H>(
        transport: T,
        config: OutstationConfig,
        points: impl IntoIterator<Item = Point>,
        handler: H,
    ) -> Dnp3Result<Self>
    where
        T: Dnp3Transport,
        H: ControlHandler,
    {
        let diagnostics = Diagnostics::new(config.session.filter_level);
        Self::spawn_with(transport, config, points, handler, diagnostics)
    }

    pub fn spawn_with<T, H>(
        transport: T,
        config: OutstationConfig,
        points: impl IntoIterator<Item = Point>,
        handler: H,
        diagnostics: Diagnostics,
    ) -> Dnp3Result<Self>
    where
        T: Dnp3Transport,
        H: ControlHandler,
    {
        runtime::ensure_active()?;
        config.validate()?;
        let diagnostics = diagnostics.for_component("outstation");
        diagnostics.set_level(config.session.filter_level);

        let (mut machine, state) = StateMachine::new(SessionState::Closed);
        machine.apply(SessionEvent::Open)?;
        machine.apply(SessionEvent::OpenSucceeded)?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let db = PointDatabase::with_points(points);
        let reader = db.reader();
        let session = &config.session;
        let channel = LinkChannel::new(
            session.local_link_address,
            session.remote_link_address,
            false,
            session.max_fragment_size,
            &diagnostics,
        );

        let task = OutstationTask {
            transport,
            channel,
            events: EventBuffer::new(config.event_buffer_size),
            null_unsolicited_pending: config.allow_unsolicited,
            config,
            diagnostics: diagnostics.clone(),
            machine,
            db,
            handler,
            commands: commands_rx,
            commands_open: true,
            iin: Iin::new(Iin::DEVICE_RESTART),
            select: None,
            last_response: None,
            solicited: None,
            unsolicited: None,
            unsolicited_seq: Sequence::default(),
            unsolicited_enabled: [false; 3],
        };
        tokio::spawn(task.run());

        Ok(Self {
            commands: commands_tx,
            state,
            points: reader,
            diagnostics,
        })
    }

    /// Update one point, recording an event if an input changed
    pub async fn update(&self, point: Point) -> Dnp3Result<()> {
        self.update_many(vec![point]).await.map(|_| ())
    }

    /// Update several points; returns how many were accepted
    pub async fn update_many(&self, points: Vec<Point>) -> Dnp3Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(OutstationCommand::Update(points, tx))
            .await
            .map_err(|_| Dnp3Error::ConnectionLost)?;
        rx.await.map_err(|_| Dnp3Error::ConnectionLost)
    }

    /// Raise or clear NEED_TIME
    pub async fn set_need_time(&self, need: bool) -> Dnp3Result<()> {
        self.set_iin(Iin::NEED_TIME, need).await
    }

    /// Raise or clear DEVICE_TROUBLE
    pub async fn set_device_trouble(&self, trouble: bool) -> Dnp3Result<()> {
        self.set_iin(Iin::DEVICE_TROUBLE, trouble).await
    }

    async fn set_iin(&self, bit: u16, set: bool) -> Dnp3Result<()> {
        self.commands
            .send(OutstationCommand::SetIin { bit, set })
            .await
            .map_err(|_| Dnp3Error::ConnectionLost)
    }

    pub fn points(&self) -> &PointReader {
        &self.points
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn filter_level(&self) -> FilterLevel {
        self.diagnostics.level()
    }

    pub fn set_filter_level(&self, level: FilterLevel) {
        self.diagnostics.set_level(level);
    }

    /// Drop the connection and stop the session
    pub async fn close(&self) -> Dnp3Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(OutstationCommand::Close(tx)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// TCP listener that starts an outstation session per accepted master
#[derive(Debug)]
pub struct OutstationServer {
    listener: TcpListener,
    config: OutstationConfig,
}

impl OutstationServer {
    /// Listen on the configured address and port
    pub async fn bind(config: OutstationConfig) -> Dnp3Result<Self> {
        runtime::ensure_active()?;
        config.validate()?;
        let endpoint = config.session.transport.endpoint();
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|e| Dnp3Error::connection(format!("Failed to listen on {}: {}", endpoint, e)))?;
        tracing::info!("Outstation listening on {}", endpoint);
        Ok(Self { listener, config })
    }

    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, config: OutstationConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> Dnp3Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for a master and start a session serving `points`
    pub async fn accept<H: ControlHandler>(
        &self,
        points: impl IntoIterator<Item = Point>,
        handler: H,
    ) -> Dnp3Result<OutstationHandle> {
        let transport = TcpTransport::accept(&self.listener).await?;
        tracing::info!("Master connected from {:?}", transport.peer_address());
        OutstationHandle::spawn(transport, self.config.clone(), points, handler)
    }
}

// ============================================================================
// Session task
// ============================================================================

#[derive(Debug)]
struct SelectRecord {
    seq: u8,
    objects: Bytes,
    deadline: Instant,
}

#[derive(Debug)]
struct CachedResponse {
    request: Bytes,
    response: Bytes,
}

/// A solicited response waiting for CONFIRM
#[derive(Debug)]
struct SolicitedConfirm {
    seq: u8,
    remaining: VecDeque<Bytes>,
    event_ids: Vec<u64>,
    deadline: Instant,
}

#[derive(Debug)]
struct PendingUnsolicited {
    seq: u8,
    fragment: Bytes,
    event_ids: Vec<u64>,
    attempts: u32,
    deadline: Instant,
}

enum Wake {
    Command(Option<OutstationCommand>),
    Received(Dnp3Result<Option<Bytes>>),
    Timeout,
}

/// Outcome of a request: response objects plus request-error IIN bits
#[derive(Default)]
struct Reply {
    objects: Vec<ObjectBlock>,
    errors: Iin,
    event_ids: Vec<u64>,
}

impl Reply {
    fn error(bit: u16) -> Self {
        Self {
            errors: Iin::new(bit),
            ..Self::default()
        }
    }
}

struct OutstationTask<T, H> {
    transport: T,
    channel: LinkChannel,
    config: OutstationConfig,
    diagnostics: Diagnostics,
    machine: StateMachine,
    db: PointDatabase,
    events: EventBuffer,
    handler: H,
    commands: mpsc::Receiver<OutstationCommand>,
    commands_open: bool,
    /// Indications owned by the outstation itself (restart, time, trouble)
    iin: Iin,
    select: Option<SelectRecord>,
    last_response: Option<CachedResponse>,
    solicited: Option<SolicitedConfirm>,
    unsolicited: Option<PendingUnsolicited>,
    unsolicited_seq: Sequence,
    unsolicited_enabled: [bool; 3],
    null_unsolicited_pending: bool,
}

impl<T: Dnp3Transport, H: ControlHandler> OutstationTask<T, H> {
    async fn run(mut self) {
        let reason = loop {
            if let Err(e) = self.report_unsolicited().await {
                if e.is_fatal() {
                    break e;
                }
                self.diagnostics.emit_with(FilterLevel::Warn, || e.to_string());
            }

            let deadline = self.next_deadline();
            let wake = tokio::select! {
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                received = self.transport.receive() => Wake::Received(received),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Timeout,
            };

            let result = match wake {
                Wake::Command(Some(OutstationCommand::Update(points, ack))) => {
                    let _ = ack.send(self.update_points(points));
                    Ok(())
                }
                Wake::Command(Some(OutstationCommand::SetIin { bit, set })) => {
                    if set {
                        self.iin.set(bit);
                    } else {
                        self.iin.clear(bit);
                    }
                    Ok(())
                }
                Wake::Command(Some(OutstationCommand::Close(ack))) => {
                    self.diagnostics.emit(FilterLevel::Info, "Session closed");
                    self.teardown(SessionEvent::Close).await;
                    let _ = ack.send(());
                    return;
                }
                Wake::Command(None) => {
                    // Handles are gone; keep serving the master
                    self.commands_open = false;
                    Ok(())
                }
                Wake::Received(Ok(Some(bytes))) => self.on_bytes(&bytes).await,
                Wake::Received(Ok(None)) => Err(Dnp3Error::ConnectionLost),
                Wake::Received(Err(e)) => Err(e),
                Wake::Timeout => self.on_timeout().await,
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    break e;
                }
                self.diagnostics.emit_with(FilterLevel::Warn, || e.to_string());
            }
        };

        self.diagnostics
            .emit_with(FilterLevel::Info, || format!("Master disconnected: {}", reason));
        self.teardown(SessionEvent::TransportClosed).await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        let solicited = self.solicited.as_ref().map(|s| s.deadline);
        let unsolicited = self.unsolicited.as_ref().map(|u| u.deadline);
        match (solicited, unsolicited) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ------------------------------------------------------------------------
    // Point updates and IIN
    // ------------------------------------------------------------------------

    fn update_points(&mut self, points: Vec<Point>) -> usize {
        let mut accepted = 0;
        for point in points {
            if !point.value.matches(point.point_type) {
                self.diagnostics.emit_with(FilterLevel::Warn, || {
                    format!(
                        "Rejecting update of {}[{}]: {} does not fit the point type",
                        point.point_type, point.index, point.value
                    )
                });
                continue;
            }
            self.store_point(point);
            accepted += 1;
        }
        accepted
    }

    /// Write a point; record an event when an input point changed
    fn store_point(&mut self, point: Point) {
        let point = match point.timestamp {
            Some(_) => point,
            None => point.with_timestamp(DnpTime::now()),
        };
        let previous = self.db.update(point);

        let changed = previous.map_or(false, |p| p.value != point.value || p.flags != point.flags);
        let class = self.config.event_classes.get(&point.point_type).copied();
        if let (true, Some(class), Some(_)) = (changed, class, Variation::default_event(point.point_type)) {
            self.events.push(class, point);
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!(
                    "{:?} event for {}[{}] = {}",
                    class, point.point_type, point.index, point.value
                )
            });
        }
    }

    fn current_iin(&self) -> Iin {
        let mut iin = self.iin;
        for class in EventClass::ALL {
            if self.events.contains_class(class) {
                iin.set(class_bit(class));
            }
        }
        if self.events.is_overflowed() {
            iin.set(Iin::EVENT_BUFFER_OVERFLOW);
        }
        iin
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    async fn on_bytes(&mut self, bytes: &[u8]) -> Dnp3Result<()> {
        let received = self.channel.receive(bytes);
        self.channel
            .send_replies(&mut self.transport, &received.replies)
            .await?;
        for fragment in received.fragments {
            self.on_fragment(fragment).await?;
        }
        Ok(())
    }

    async fn on_fragment(&mut self, raw: Bytes) -> Dnp3Result<()> {
        let received_at = Instant::now();
        let request = match app::parse(&raw) {
            Ok(request) => request,
            Err(e) => return self.reject(&raw, e).await,
        };

        match request.function {
            FunctionCode::Confirm => return self.on_confirm(request.control).await,
            FunctionCode::Response | FunctionCode::UnsolicitedResponse => {
                self.diagnostics
                    .emit(FilterLevel::Warn, "Ignoring response sent by the master");
                return Ok(());
            }
            _ => {}
        }

        if let Some(cached) = self.last_response.as_ref().filter(|c| c.request == raw) {
            let response = cached.response.clone();
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!("Repeated request seq {}, resending response", request.control.seq)
            });
            if let Some(solicited) = self.solicited.as_mut() {
                solicited.deadline = Instant::now() + self.config.session.response_timeout();
            }
            return self.channel.send(&mut self.transport, &response).await;
        }

        // A new request abandons any response still waiting for CONFIRM
        if let Some(solicited) = self.solicited.take() {
            self.events.release(&solicited.event_ids);
        }

        self.diagnostics.emit_with(FilterLevel::Debug, || {
            format!(
                "{} seq {} with {} object header(s)",
                request.function,
                request.control.seq,
                request.objects.len()
            )
        });

        let objects = raw.slice(REQUEST_HEADER_LEN..);
        let reply = match request.function {
            FunctionCode::Read => self.handle_read(&request)?,
            FunctionCode::Write => self.handle_write(&request),
            FunctionCode::Select => self.handle_select(&request, objects),
            FunctionCode::Operate => self.handle_operate(&request, &objects),
            FunctionCode::DirectOperate => self.handle_direct(&request),
            FunctionCode::DirectOperateNoAck => {
                self.handle_direct(&request);
                return Ok(());
            }
            FunctionCode::EnableUnsolicited => self.handle_unsolicited_control(&request, true),
            FunctionCode::DisableUnsolicited => self.handle_unsolicited_control(&request, false),
            FunctionCode::DelayMeasure => {
                let delay = received_at.elapsed().as_millis().min(u128::from(u16::MAX)) as u16;
                let block = ObjectBlock::count(Variation::Group52Var2, vec![ObjectValue::Delay(delay)])?;
                Reply {
                    objects: vec![block],
                    ..Reply::default()
                }
            }
            FunctionCode::ColdRestart | FunctionCode::WarmRestart => {
                Reply::error(Iin::NO_FUNC_CODE_SUPPORT)
            }
            FunctionCode::Confirm | FunctionCode::Response | FunctionCode::UnsolicitedResponse => {
                return Ok(())
            }
        };

        if reply.errors.has_request_error() {
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!("{} seq {} answered with IIN {}", request.function, request.control.seq, reply.errors)
            });
        }
        self.respond(request.control.seq, reply, raw).await
    }

    /// Answer an unparseable request with the matching IIN2 error bit
    async fn reject(&mut self, raw: &[u8], error: Dnp3Error) -> Dnp3Result<()> {
        self.diagnostics
            .emit_with(FilterLevel::Warn, || format!("Rejecting request: {}", error));
        if raw.len() < REQUEST_HEADER_LEN {
            return Ok(());
        }
        let code = raw[1];
        if code == FunctionCode::Confirm.to_u8() || code == FunctionCode::DirectOperateNoAck.to_u8() {
            return Ok(());
        }
        let bit = match error {
            Dnp3Error::UnknownFunction { .. } => Iin::NO_FUNC_CODE_SUPPORT,
            Dnp3Error::UnknownObject { .. } => Iin::OBJECT_UNKNOWN,
            _ => Iin::PARAMETER_ERROR,
        };
        let seq = AppControl::from_u8(raw[0]).seq;
        let fragment = FragmentBuilder::response(
            FunctionCode::Response,
            AppControl::single(seq),
            self.current_iin().union(Iin::new(bit)),
        )
        .build();
        self.last_response = None;
        self.channel.send(&mut self.transport, &fragment).await
    }

    // ------------------------------------------------------------------------
    // READ
    // ------------------------------------------------------------------------

    fn handle_read(&mut self, request: &ParsedFragment) -> Dnp3Result<Reply> {
        let reader = self.db.reader();
        let mut reply = Reply::default();
        let mut classes = [false; 3];
        let mut event_types = BTreeSet::new();
        let mut statics = Vec::new();

        for block in &request.objects {
            let variation = block.variation();
            match (variation.class_number(), variation.point_type()) {
                (Some(0), _) => {
                    for point_type in PointType::ALL {
                        let points = reader.points_of(point_type);
                        statics.extend(self.static_blocks(Variation::default_static(point_type), &points)?);
                    }
                }
                (Some(class), _) => classes[usize::from(class) - 1] = true,
                (None, Some(point_type)) if variation.is_event() => {
                    if variation.encoding() == Encoding::NoData {
                        event_types.insert(point_type);
                    } else {
                        reply.errors.set(Iin::OBJECT_UNKNOWN);
                    }
                }
                (None, Some(point_type)) => {
                    let points = match block.header.range {
                        HeaderRange::All => reader.points_of(point_type),
                        HeaderRange::StartStop { start, stop } => {
                            let points = reader.range(point_type, start, stop);
                            if points.is_empty() {
                                reply.errors.set(Iin::PARAMETER_ERROR);
                                continue;
                            }
                            points
                        }
                        HeaderRange::Count(_) | HeaderRange::Prefixed(_) => {
                            reply.errors.set(Iin::PARAMETER_ERROR);
                            continue;
                        }
                    };
                    let variation = match variation.encoding() {
                        Encoding::NoData => Variation::default_static(point_type),
                        _ => variation,
                    };
                    statics.extend(self.static_blocks(variation, &points)?);
                }
                (None, None) => reply.errors.set(Iin::OBJECT_UNKNOWN),
            }
        }

        if classes.iter().any(|c| *c) || !event_types.is_empty() {
            let events = self.events.select(|event| {
                classes[class_index(event.class)] || event_types.contains(&event.point.point_type)
            });
            let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
            match event_blocks(&events, self.block_capacity()) {
                Ok(blocks) => {
                    reply.event_ids = ids;
                    reply.objects = blocks;
                }
                Err(e) => {
                    // Unreported events stay queued for the next read
                    self.events.release(&ids);
                    self.diagnostics
                        .emit_with(FilterLevel::Warn, || format!("Events not reported: {}", e));
                    reply.errors.set(Iin::PARAMETER_ERROR);
                }
            }
        }
        reply.objects.extend(statics);
        Ok(reply)
    }

    fn block_capacity(&self) -> usize {
        self.config
            .session
            .max_fragment_size
            .saturating_sub(RESPONSE_HEADER_LEN + MAX_OBJECT_HEADER_LEN)
            .max(1)
    }

    /// Range blocks covering `points`, split at index gaps and at the
    /// fragment size
    fn static_blocks(&self, variation: Variation, points: &[Point]) -> Dnp3Result<Vec<ObjectBlock>> {
        let max_items = match variation.encoding() {
            Encoding::Fixed(size) => (self.block_capacity() / size).max(1),
            Encoding::Packed => self.block_capacity() * 8,
            Encoding::NoData => return Ok(Vec::new()),
        };

        let mut blocks = Vec::new();
        let mut run: Vec<&Point> = Vec::new();
        for point in points {
            let contiguous = run
                .last()
                .map_or(true, |last| u32::from(last.index) + 1 == u32::from(point.index));
            if !contiguous || run.len() == max_items {
                blocks.push(range_block(variation, &run)?);
                run.clear();
            }
            run.push(point);
        }
        if !run.is_empty() {
            blocks.push(range_block(variation, &run)?);
        }
        Ok(blocks)
    }

    // ------------------------------------------------------------------------
    // WRITE
    // ------------------------------------------------------------------------

    fn handle_write(&mut self, request: &ParsedFragment) -> Reply {
        let mut reply = Reply::default();
        for block in &request.objects {
            match block.variation() {
                Variation::Group50Var1 => match block.items.first() {
                    Some((_, ObjectValue::Time(time))) => {
                        self.iin.clear(Iin::NEED_TIME);
                        self.diagnostics
                            .emit_with(FilterLevel::Info, || format!("Clock set to {}", time));
                    }
                    _ => reply.errors.set(Iin::PARAMETER_ERROR),
                },
                Variation::Group80Var1 => {
                    for (index, value) in &block.items {
                        match value {
                            ObjectValue::Binary { state: false, .. } if *index == Iin::RESTART_INDEX => {
                                self.iin.clear(Iin::DEVICE_RESTART);
                                self.diagnostics
                                    .emit(FilterLevel::Info, "DEVICE_RESTART cleared by master");
                            }
                            _ => reply.errors.set(Iin::PARAMETER_ERROR),
                        }
                    }
                }
                _ => reply.errors.set(Iin::OBJECT_UNKNOWN),
            }
        }
        reply
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    /// Commands carried by a control request, or the IIN bit explaining
    /// why they cannot be processed
    fn commands(request: &ParsedFragment) -> Result<Vec<(u16, OutputCommand)>, u16> {
        let mut commands = Vec::new();
        for block in &request.objects {
            match block.variation() {
                Variation::Group12Var1
                | Variation::Group41Var1
                | Variation::Group41Var2
                | Variation::Group41Var3 => {}
                _ => return Err(Iin::OBJECT_UNKNOWN),
            }
            if !matches!(block.header.range, HeaderRange::Prefixed(_)) {
                return Err(Iin::PARAMETER_ERROR);
            }
            for (index, value) in &block.items {
                let command = match value {
                    ObjectValue::Crob(crob) => OutputCommand::Crob(*crob),
                    ObjectValue::AnalogCommand(analog) => OutputCommand::Analog(*analog),
                    _ => return Err(Iin::PARAMETER_ERROR),
                };
                commands.push((*index, command));
            }
        }
        if commands.is_empty() {
            return Err(Iin::PARAMETER_ERROR);
        }
        Ok(commands)
    }

    /// Echo the request objects with one status per command
    fn echo(request: &ParsedFragment, statuses: &[CommandStatus]) -> Vec<ObjectBlock> {
        let mut statuses = statuses.iter().copied();
        request
            .objects
            .iter()
            .map(|block| {
                let items = block
                    .items
                    .iter()
                    .map(|(index, value)| {
                        let status = statuses.next().unwrap_or(CommandStatus::FormatError);
                        let value = match value {
                            ObjectValue::Crob(crob) => ObjectValue::Crob(crob.with_status(status)),
                            ObjectValue::AnalogCommand(analog) => {
                                ObjectValue::AnalogCommand(analog.with_status(status))
                            }
                            other => *other,
                        };
                        (*index, value)
                    })
                    .collect();
                ObjectBlock {
                    header: block.header,
                    items,
                }
            })
            .collect()
    }

    fn too_many(&self, commands: &[(u16, OutputCommand)]) -> Option<Vec<CommandStatus>> {
        (commands.len() > self.config.max_controls_per_request)
            .then(|| vec![CommandStatus::TooManyOps; commands.len()])
    }

    fn handle_select(&mut self, request: &ParsedFragment, objects: Bytes) -> Reply {
        self.select = None;
        let commands = match Self::commands(request) {
            Ok(commands) => commands,
            Err(bit) => return Reply::error(bit),
        };

        let statuses = self.too_many(&commands).unwrap_or_else(|| {
            let reader = self.db.reader();
            commands
                .iter()
                .map(|(index, command)| self.handler.select(*index, command, &reader))
                .collect()
        });

        if statuses.iter().all(CommandStatus::is_success) {
            self.select = Some(SelectRecord {
                seq: request.control.seq,
                objects,
                deadline: Instant::now() + self.config.select_timeout(),
            });
        }
        Reply {
            objects: Self::echo(request, &statuses),
            ..Reply::default()
        }
    }

    fn handle_operate(&mut self, request: &ParsedFragment, objects: &Bytes) -> Reply {
        let select = self.select.take();
        let commands = match Self::commands(request) {
            Ok(commands) => commands,
            Err(bit) => return Reply::error(bit),
        };

        let statuses = if let Some(statuses) = self.too_many(&commands) {
            statuses
        } else {
            let seq = request.control.seq;
            match select {
                Some(record) if Sequence::new(record.seq).next().value() == seq && record.objects == *objects => {
                    if Instant::now() < record.deadline {
                        self.execute(&commands)
                    } else {
                        self.diagnostics.emit(FilterLevel::Warn, "OPERATE after select timeout");
                        vec![CommandStatus::Timeout; commands.len()]
                    }
                }
                _ => {
                    self.diagnostics
                        .emit(FilterLevel::Warn, "OPERATE does not match a preceding SELECT");
                    vec![CommandStatus::NoSelect; commands.len()]
                }
            }
        };
        Reply {
            objects: Self::echo(request, &statuses),
            ..Reply::default()
        }
    }

    fn handle_direct(&mut self, request: &ParsedFragment) -> Reply {
        let commands = match Self::commands(request) {
            Ok(commands) => commands,
            Err(bit) => return Reply::error(bit),
        };
        let statuses = match self.too_many(&commands) {
            Some(statuses) => statuses,
            None => self.execute(&commands),
        };
        Reply {
            objects: Self::echo(request, &statuses),
            ..Reply::default()
        }
    }

    fn execute(&mut self, commands: &[(u16, OutputCommand)]) -> Vec<CommandStatus> {
        let reader = self.db.reader();
        commands
            .iter()
            .map(|(index, command)| {
                let status = self.handler.operate(*index, command, &reader);
                if status.is_success() {
                    if let Some(value) = command.commanded_value() {
                        self.store_point(Point::new(*index, command.point_type(), value));
                    }
                }
                self.diagnostics.emit_with(FilterLevel::Info, || {
                    format!("Operate {}[{}]: {:?}", command.point_type(), index, status)
                });
                status
            })
            .collect()
    }

    fn handle_unsolicited_control(&mut self, request: &ParsedFragment, enable: bool) -> Reply {
        if !self.config.allow_unsolicited {
            return Reply::error(Iin::NO_FUNC_CODE_SUPPORT);
        }
        let mut reply = Reply::default();
        for block in &request.objects {
            match block.variation().class_number() {
                Some(class @ 1..=3) => {
                    self.unsolicited_enabled[usize::from(class) - 1] = enable;
                    self.diagnostics.emit_with(FilterLevel::Info, || {
                        format!(
                            "Unsolicited class {} {}",
                            class,
                            if enable { "enabled" } else { "disabled" }
                        )
                    });
                }
                Some(_) => reply.errors.set(Iin::PARAMETER_ERROR),
                None => reply.errors.set(Iin::OBJECT_UNKNOWN),
            }
        }
        reply
    }

    // ------------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------------

    /// Split encoded objects into fragment bodies
    fn split(&self, objects: &[ObjectBlock]) -> Dnp3Result<Vec<Vec<u8>>> {
        let capacity = self
            .config
            .session
            .max_fragment_size
            .saturating_sub(RESPONSE_HEADER_LEN);
        let mut bodies = Vec::new();
        let mut current = Vec::new();
        for block in objects {
            let mut encoded = Vec::new();
            block.encode(&mut encoded)?;
            if !current.is_empty() && current.len() + encoded.len() > capacity {
                bodies.push(std::mem::take(&mut current));
            }
            current.extend(encoded);
        }
        bodies.push(current);
        Ok(bodies)
    }

    async fn respond(&mut self, seq: u8, reply: Reply, request: Bytes) -> Dnp3Result<()> {
        let bodies = match self.split(&reply.objects) {
            Ok(bodies) => bodies,
            Err(e) => {
                self.events.release(&reply.event_ids);
                return Err(e);
            }
        };
        let iin = self.current_iin().union(reply.errors);
        let has_events = !reply.event_ids.is_empty();
        let last = bodies.len() - 1;

        let mut sequence = Sequence::new(seq);
        let mut fragments: VecDeque<Bytes> = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| {
                let control = AppControl {
                    fir: i == 0,
                    fin: i == last,
                    con: i < last || has_events,
                    uns: false,
                    seq: sequence.increment(),
                };
                FragmentBuilder::response(FunctionCode::Response, control, iin)
                    .raw(body)
                    .build()
            })
            .collect();

        let Some(first) = fragments.pop_front() else {
            return Ok(());
        };
        self.last_response = fragments.is_empty().then(|| CachedResponse {
            request,
            response: first.clone(),
        });
        self.channel.send(&mut self.transport, &first).await?;

        if AppControl::from_u8(first[0]).con {
            self.solicited = Some(SolicitedConfirm {
                seq,
                remaining: fragments,
                event_ids: reply.event_ids,
                deadline: Instant::now() + self.config.session.response_timeout(),
            });
        }
        Ok(())
    }

    async fn on_confirm(&mut self, control: AppControl) -> Dnp3Result<()> {
        if control.uns {
            match self.unsolicited.take() {
                Some(pending) if pending.seq == control.seq => {
                    self.events.confirm(&pending.event_ids);
                    self.machine.apply(SessionEvent::Confirmed)?;
                    self.diagnostics.emit_with(FilterLevel::Debug, || {
                        format!("Unsolicited seq {} confirmed", control.seq)
                    });
                }
                other => {
                    self.unsolicited = other;
                    self.diagnostics.emit_with(FilterLevel::Warn, || {
                        format!("Unexpected unsolicited confirm seq {}", control.seq)
                    });
                }
            }
            return Ok(());
        }

        let Some(mut solicited) = self.solicited.take() else {
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!("Ignoring confirm seq {} with nothing outstanding", control.seq)
            });
            return Ok(());
        };
        if solicited.seq != control.seq {
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!("Confirm seq {} does not match {}", control.seq, solicited.seq)
            });
            self.solicited = Some(solicited);
            return Ok(());
        }

        match solicited.remaining.pop_front() {
            Some(next) => {
                let next_control = AppControl::from_u8(next[0]);
                self.channel.send(&mut self.transport, &next).await?;
                if next_control.con {
                    solicited.seq = next_control.seq;
                    solicited.deadline = Instant::now() + self.config.session.response_timeout();
                    self.solicited = Some(solicited);
                }
            }
            None => self.events.confirm(&solicited.event_ids),
        }
        Ok(())
    }

    async fn on_timeout(&mut self) -> Dnp3Result<()> {
        let now = Instant::now();

        let solicited_expired = self.solicited.as_ref().map_or(false, |s| now >= s.deadline);
        if solicited_expired {
            if let Some(solicited) = self.solicited.take() {
                self.diagnostics.emit_with(FilterLevel::Warn, || {
                    format!("No confirm for response seq {}", solicited.seq)
                });
                self.events.release(&solicited.event_ids);
            }
        }

        let expired = self.unsolicited.as_ref().map_or(false, |u| now >= u.deadline);
        if !expired {
            return Ok(());
        }
        let Some(mut pending) = self.unsolicited.take() else {
            return Ok(());
        };
        if pending.attempts <= self.config.unsolicited_retry_count {
            pending.attempts += 1;
            pending.deadline = now + self.config.session.unsolicited_confirm_timeout();
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!(
                    "No confirm for unsolicited seq {}, retry {}/{}",
                    pending.seq,
                    pending.attempts - 1,
                    self.config.unsolicited_retry_count
                )
            });
            let fragment = pending.fragment.clone();
            self.unsolicited = Some(pending);
            self.machine.apply(SessionEvent::ConfirmRetry)?;
            self.channel.send(&mut self.transport, &fragment).await?;
        } else {
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!(
                    "Unsolicited seq {} unconfirmed after {} attempt(s)",
                    pending.seq, pending.attempts
                )
            });
            self.events.release(&pending.event_ids);
            self.machine.apply(SessionEvent::ConfirmRetriesExhausted)?;
        }
        Ok(())
    }

    /// Send the startup null response or pending events for enabled classes
    async fn report_unsolicited(&mut self) -> Dnp3Result<()> {
        if !self.config.allow_unsolicited
            || self.unsolicited.is_some()
            || self.solicited.is_some()
            || self.machine.state() != SessionState::Idle
        {
            return Ok(());
        }

        let (objects, event_ids) = if self.null_unsolicited_pending {
            self.null_unsolicited_pending = false;
            (Vec::new(), Vec::new())
        } else {
            let enabled = self.unsolicited_enabled;
            let ready = EventClass::ALL
                .iter()
                .any(|class| enabled[class_index(*class)] && self.events.has_unreported(*class));
            if !ready {
                return Ok(());
            }
            let events = self.events.select(|event| enabled[class_index(event.class)]);
            let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
            match event_blocks(&events, self.block_capacity()) {
                Ok(blocks) => (blocks, ids),
                Err(e) => {
                    self.events.release(&ids);
                    return Err(e);
                }
            }
        };

        let seq = self.unsolicited_seq.increment();
        let fragment = match app::build_response(
            FunctionCode::UnsolicitedResponse,
            AppControl::unsolicited(seq),
            self.current_iin(),
            &objects,
        ) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.events.release(&event_ids);
                return Err(e);
            }
        };

        self.diagnostics.emit_with(FilterLevel::Debug, || {
            format!("Unsolicited seq {} with {} event(s)", seq, event_ids.len())
        });
        self.machine.apply(SessionEvent::ConfirmableSent)?;
        self.unsolicited = Some(PendingUnsolicited {
            seq,
            fragment: fragment.clone(),
            event_ids,
            attempts: 1,
            deadline: Instant::now() + self.config.session.unsolicited_confirm_timeout(),
        });
        self.channel.send(&mut self.transport, &fragment).await
    }

    async fn teardown(&mut self, event: SessionEvent) {
        let _ = self.transport.close().await;
        self.select = None;
        self.solicited = None;
        self.unsolicited = None;
        self.channel.reset();
        if let Err(e) = self.machine.apply(event) {
            self.diagnostics.emit_with(FilterLevel::Debug, || e.to_string());
        }
    }
}

/// Prefixed event blocks, one per run of same-type events. A run never
/// exceeds the fragment capacity or the 16-bit object count.
fn event_blocks(events: &[Event], capacity: usize) -> Dnp3Result<Vec<ObjectBlock>> {
    let mut blocks = Vec::new();
    let mut run: Vec<(u16, ObjectValue)> = Vec::new();
    let mut run_variation: Option<Variation> = None;

    for event in events {
        let Some(variation) = Variation::default_event(event.point.point_type) else {
            continue;
        };
        let max_items = match variation.encoding() {
            Encoding::Fixed(size) => (capacity / (size + 2)).clamp(1, usize::from(u16::MAX)),
            _ => 1,
        };
        if run_variation != Some(variation) || run.len() == max_items {
            if let Some(previous) = run_variation {
                blocks.push(ObjectBlock::prefixed(previous, std::mem::take(&mut run))?);
            }
            run_variation = Some(variation);
        }
        run.push((event.point.index, ObjectValue::from_point(&event.point)));
    }
    if let Some(variation) = run_variation {
        if !run.is_empty() {
            blocks.push(ObjectBlock::prefixed(variation, run)?);
        }
    }
    Ok(blocks)
}

fn range_block(variation: Variation, run: &[&Point]) -> Dnp3Result<ObjectBlock> {
    let start = run.first().map_or(0, |p| p.index);
    let values = run.iter().map(|p| ObjectValue::from_point(p)).collect();
    ObjectBlock::range(variation, start, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlRelayOutputBlock;
    use crate::point::PointValue;
    use crate::transport::StreamTransport;
    use tokio::io::DuplexStream;

    /// Scripted master on the far end of an in-memory pipe
    struct FakeMaster {
        transport: StreamTransport<DuplexStream>,
        channel: LinkChannel,
        pending: VecDeque<ParsedFragment>,
        seq: Sequence,
    }

    impl FakeMaster {
        async fn next(&mut self) -> ParsedFragment {
            loop {
                if let Some(fragment) = self.pending.pop_front() {
                    return fragment;
                }
                let bytes = self.transport.receive().await.unwrap().unwrap();
                for fragment in self.channel.receive(&bytes).fragments {
                    self.pending.push_back(app::parse(&fragment).unwrap());
                }
            }
        }

        /// Next solicited response, confirming stray unsolicited ones
        async fn response(&mut self) -> ParsedFragment {
            loop {
                let fragment = self.next().await;
                if fragment.function == FunctionCode::UnsolicitedResponse {
                    self.confirm(fragment.control.seq, true).await;
                    continue;
                }
                return fragment;
            }
        }

        async fn send_raw(&mut self, fragment: &[u8]) {
            self.channel.send(&mut self.transport, fragment).await.unwrap();
        }

        async fn request(&mut self, function: FunctionCode, objects: &[ObjectBlock]) -> u8 {
            let seq = self.seq.increment();
            let fragment = app::build(function, AppControl::single(seq), objects).unwrap();
            self.send_raw(&fragment).await;
            seq
        }

        async fn confirm(&mut self, seq: u8, uns: bool) {
            let control = AppControl {
                uns,
                ..AppControl::single(seq)
            };
            let fragment = app::build(FunctionCode::Confirm, control, &[]).unwrap();
            self.send_raw(&fragment).await;
        }
    }

    fn points() -> Vec<Point> {
        vec![
            Point::binary_input(0, false),
            Point::binary_input(1, true),
            Point::binary_output(3, false),
            Point::analog_input(0, 20.5),
            Point::analog_output(0, 0.0),
            Point::counter(0, 7),
        ]
    }

    fn pair(config: OutstationConfig) -> (OutstationHandle, FakeMaster) {
        let (a, b) = tokio::io::duplex(8192);
        let outstation =
            OutstationHandle::spawn(StreamTransport::from_stream(a), config, points(), DatabaseControlHandler)
                .unwrap();
        let master = FakeMaster {
            transport: StreamTransport::from_stream(b),
            channel: LinkChannel::new(1, 1024, true, 4096, &Diagnostics::default()),
            pending: VecDeque::new(),
            seq: Sequence::default(),
        };
        (outstation, master)
    }

    fn crob_block(index: u16, crob: ControlRelayOutputBlock) -> ObjectBlock {
        ObjectBlock::prefixed(Variation::Group12Var1, vec![(index, ObjectValue::Crob(crob))]).unwrap()
    }

    fn echoed_status(response: &ParsedFragment) -> CommandStatus {
        match response.objects[0].items[0].1 {
            ObjectValue::Crob(crob) => crob.status,
            ObjectValue::AnalogCommand(analog) => analog.status,
            ref other => panic!("unexpected echo {:?}", other),
        }
    }

    #[test]
    fn test_event_buffer_overflow_and_confirm() {
        let mut buffer = EventBuffer::new(2);
        buffer.push(EventClass::Class1, Point::binary_input(0, true));
        buffer.push(EventClass::Class1, Point::binary_input(0, false));
        assert!(!buffer.is_overflowed());
        buffer.push(EventClass::Class2, Point::analog_input(0, 1.0));
        assert!(buffer.is_overflowed());
        assert_eq!(buffer.len(), 2);

        let selected = buffer.select(|e| e.class == EventClass::Class1);
        assert_eq!(selected.len(), 1);
        assert!(!buffer.has_unreported(EventClass::Class1));
        assert!(buffer.contains_class(EventClass::Class1));

        buffer.release(&[selected[0].id]);
        assert!(buffer.has_unreported(EventClass::Class1));

        let selected = buffer.select(|_| true);
        assert_eq!(selected.len(), 2);
        buffer.confirm(&selected.iter().map(|e| e.id).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert!(!buffer.is_overflowed());
    }

    #[test]
    fn test_event_blocks_stay_within_object_count() {
        let events: Vec<Event> = (0..70_000u64)
            .map(|id| Event {
                id,
                class: EventClass::Class1,
                point: Point::binary_input((id % 100) as u16, id % 2 == 0),
            })
            .collect();

        let blocks = event_blocks(&events, 1_000_000).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].items.len(), usize::from(u16::MAX));
        assert_eq!(blocks.iter().map(|b| b.items.len()).sum::<usize>(), events.len());
    }

    #[tokio::test]
    async fn test_startup_null_unsolicited() {
        let (outstation, mut master) = pair(OutstationConfig::default());
        let unsolicited = master.next().await;
        assert_eq!(unsolicited.function, FunctionCode::UnsolicitedResponse);
        assert!(unsolicited.control.uns && unsolicited.control.con);
        assert_eq!(unsolicited.control.seq, 0);
        assert!(unsolicited.iin.unwrap().contains(Iin::DEVICE_RESTART));
        assert!(unsolicited.objects.is_empty());
        assert_eq!(outstation.state(), SessionState::AwaitingConfirmation);

        master.confirm(0, true).await;
        let mut state = outstation.subscribe_state();
        state.wait_for(|s| *s == SessionState::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn test_integrity_poll_reports_all_points() {
        let (_outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        master
            .request(
                FunctionCode::Read,
                &[
                    ObjectBlock::all(Variation::Group60Var2),
                    ObjectBlock::all(Variation::Group60Var3),
                    ObjectBlock::all(Variation::Group60Var4),
                    ObjectBlock::all(Variation::Group60Var1),
                ],
            )
            .await;
        let response = master.response().await;
        let reported: Vec<Point> = response.objects.iter().flat_map(ObjectBlock::points).collect();
        assert_eq!(reported.len(), points().len());
        let variations: Vec<_> = response.objects.iter().map(|b| b.variation()).collect();
        assert!(variations.contains(&Variation::Group1Var2));
        assert!(variations.contains(&Variation::Group30Var5));
        assert!(!response.control.con);
    }

    #[tokio::test]
    async fn test_read_unknown_range_sets_parameter_error() {
        let (_outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        let block = ObjectBlock::range_request(Variation::Group30Var0, 50, 60).unwrap();
        master.request(FunctionCode::Read, &[block]).await;
        let response = master.response().await;
        assert!(response.iin.unwrap().contains(Iin::PARAMETER_ERROR));
    }

    #[tokio::test]
    async fn test_unknown_function_sets_iin() {
        let (_outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        master.send_raw(&[0xC5, 0x70]).await;
        let response = master.response().await;
        assert_eq!(response.control.seq, 5);
        assert!(response.iin.unwrap().contains(Iin::NO_FUNC_CODE_SUPPORT));
    }

    #[tokio::test]
    async fn test_select_operate_sequence() {
        let (outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        let block = crob_block(3, ControlRelayOutputBlock::latch_on());

        let seq = master.request(FunctionCode::Select, &[block.clone()]).await;
        let response = master.response().await;
        assert_eq!(response.control.seq, seq);
        assert_eq!(echoed_status(&response), CommandStatus::Success);

        master.request(FunctionCode::Operate, &[block]).await;
        let response = master.response().await;
        assert_eq!(echoed_status(&response), CommandStatus::Success);
        assert_eq!(
            outstation.points().read(PointType::BinaryOutput, 3).unwrap().value,
            PointValue::Binary(true)
        );
    }

    #[tokio::test]
    async fn test_operate_with_different_objects_is_no_select() {
        let (outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        master
            .request(FunctionCode::Select, &[crob_block(3, ControlRelayOutputBlock::latch_on())])
            .await;
        master.response().await;

        master
            .request(FunctionCode::Operate, &[crob_block(3, ControlRelayOutputBlock::latch_off())])
            .await;
        let response = master.response().await;
        assert_eq!(echoed_status(&response), CommandStatus::NoSelect);
        assert_eq!(
            outstation.points().read(PointType::BinaryOutput, 3).unwrap().value,
            PointValue::Binary(false)
        );
    }

    #[tokio::test]
    async fn test_repeated_request_replays_response() {
        let (outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        let fragment = app::build(
            FunctionCode::DirectOperate,
            AppControl::single(4),
            &[crob_block(3, ControlRelayOutputBlock::latch_on())],
        )
        .unwrap();

        master.send_raw(&fragment).await;
        let first = master.response().await;
        master.send_raw(&fragment).await;
        let second = master.response().await;
        assert_eq!(first, second);
        assert_eq!(echoed_status(&second), CommandStatus::Success);
        assert_eq!(
            outstation.points().read(PointType::BinaryOutput, 3).unwrap().value,
            PointValue::Binary(true)
        );
    }

    #[tokio::test]
    async fn test_too_many_controls() {
        let config = OutstationConfig::default()
            .with_allow_unsolicited(false)
            .with_max_controls_per_request(1);
        let (_outstation, mut master) = pair(config);
        let block = ObjectBlock::prefixed(
            Variation::Group12Var1,
            vec![
                (3, ObjectValue::Crob(ControlRelayOutputBlock::latch_on())),
                (3, ObjectValue::Crob(ControlRelayOutputBlock::latch_off())),
            ],
        )
        .unwrap();
        master.request(FunctionCode::DirectOperate, &[block]).await;
        let response = master.response().await;
        assert_eq!(echoed_status(&response), CommandStatus::TooManyOps);
    }

    #[tokio::test]
    async fn test_unknown_point_not_supported() {
        let (_outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        master
            .request(FunctionCode::DirectOperate, &[crob_block(42, ControlRelayOutputBlock::latch_on())])
            .await;
        let response = master.response().await;
        assert_eq!(echoed_status(&response), CommandStatus::NotSupported);
    }

    #[tokio::test]
    async fn test_event_read_requires_confirm() {
        let (outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        outstation.update(Point::binary_input(0, true)).await.unwrap();

        master
            .request(FunctionCode::Read, &[ObjectBlock::all(Variation::Group60Var2)])
            .await;
        let response = master.response().await;
        assert!(response.control.con);
        assert!(response.iin.unwrap().contains(Iin::CLASS1_EVENTS));
        assert_eq!(response.objects[0].variation(), Variation::Group2Var2);
        master.confirm(response.control.seq, false).await;

        master
            .request(FunctionCode::Read, &[ObjectBlock::all(Variation::Group60Var2)])
            .await;
        let response = master.response().await;
        assert!(response.objects.is_empty());
        assert!(!response.iin.unwrap().contains(Iin::CLASS1_EVENTS));
    }

    #[tokio::test]
    async fn test_clear_restart_and_time_write() {
        let (_outstation, mut master) = pair(OutstationConfig::default().with_allow_unsolicited(false));
        let restart = ObjectBlock::range(
            Variation::Group80Var1,
            Iin::RESTART_INDEX,
            vec![ObjectValue::Binary {
                state: false,
                flags: crate::point::Flags::online(),
                time: None,
            }],
        )
        .unwrap();
        master.request(FunctionCode::Write, &[restart]).await;
        let response = master.response().await;
        let iin = response.iin.unwrap();
        assert!(!iin.contains(Iin::DEVICE_RESTART));
        assert!(!iin.has_request_error());

        master.request(FunctionCode::DelayMeasure, &[]).await;
        let response = master.response().await;
        assert_eq!(response.objects[0].variation(), Variation::Group52Var2);
    }

    #[tokio::test]
    async fn test_unsolicited_events_after_enable() {
        let (outstation, mut master) = pair(OutstationConfig::default());
        let null = master.next().await;
        master.confirm(null.control.seq, true).await;

        master
            .request(FunctionCode::EnableUnsolicited, &[ObjectBlock::all(Variation::Group60Var3)])
            .await;
        let response = master.response().await;
        assert!(!response.iin.unwrap().has_request_error());

        outstation.update(Point::analog_input(0, 99.5)).await.unwrap();
        let unsolicited = master.next().await;
        assert_eq!(unsolicited.function, FunctionCode::UnsolicitedResponse);
        assert_eq!(unsolicited.control.seq, 1);
        let points: Vec<Point> = unsolicited.objects.iter().flat_map(ObjectBlock::points).collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, PointValue::Analog(99.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_retries_same_fragment() {
        let config = OutstationConfig::default().with_unsolicited_retry_count(1);
        let (outstation, mut master) = pair(config);
        let first = master.next().await;
        let second = master.next().await;
        assert_eq!(first, second);

        let mut state = outstation.subscribe_state();
        state.wait_for(|s| *s == SessionState::Idle).await.unwrap();
    }
}
