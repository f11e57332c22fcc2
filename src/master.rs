//! Master session
//!
//! A [`MasterHandle`] drives one outstation over one connection. The session
//! itself runs as a background task that owns the transport; handles talk to
//! it over a command channel, so any number of clones may issue requests
//! concurrently. Requests are queued and sent one at a time:
//!
//! ```text
//!   handle ──► queue ──► [Idle] ──send──► [AwaitingResponse] ──FIN──► [Idle]
//!                                            │        ▲
//!                                   timeout  │        │ resend same fragment
//!                                            └────────┘ (up to retry_count)
//! ```
//!
//! Unsolicited responses are accepted in any open state, applied to the local
//! point database and confirmed with the same sequence number.
//!
//! # Example
//!
//! ```rust,no_run
//! use voltage_dnp3::{ControlRelayOutputBlock, MasterConfig, MasterHandle, TransportSettings};
//!
//! # async fn example() -> voltage_dnp3::Dnp3Result<()> {
//! let config = MasterConfig::new(TransportSettings::new("127.0.0.1", 20000));
//! let master = MasterHandle::open(config).await?;
//!
//! master.integrity_poll().await?;
//! master
//!     .select_and_operate(3, ControlRelayOutputBlock::latch_on())
//!     .await?;
//! master.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::app::{self, AppControl, FunctionCode, Iin, ParsedFragment};
use crate::control::{OutputCommand, SelectState};
use crate::database::{PointDatabase, PointReader};
use crate::error::{Dnp3Error, Dnp3Result, SelectOperateError};
use crate::logging::{Diagnostics, FilterLevel};
use crate::object::{ObjectBlock, ObjectValue, Variation};
use crate::point::{DnpTime, EventClass, Flags, Point, PointType};
use crate::runtime;
use crate::segment::LinkChannel;
use crate::session::{Sequence, SessionConfig, SessionEvent, SessionState, StateMachine};
use crate::transport::{Dnp3Transport, TcpTransport, TransportSettings};

const COMMAND_QUEUE_SIZE: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

/// Master session configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub session: SessionConfig,
    /// How long a successful SELECT stays armed
    pub select_timeout_ms: u64,
}

impl MasterConfig {
    pub fn new(transport: TransportSettings) -> Self {
        Self::from(SessionConfig::new(transport))
    }

    pub fn with_select_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.select_timeout_ms = timeout_ms;
        self
    }

    pub fn with_filter_level(mut self, level: FilterLevel) -> Self {
        self.session.filter_level = level;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.session.retry_count = retries;
        self
    }

    pub fn with_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.session.response_timeout_ms = timeout_ms;
        self
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn validate(&self) -> Dnp3Result<()> {
        self.session.validate()?;
        if self.select_timeout_ms == 0 {
            return Err(Dnp3Error::configuration("Select timeout must be non-zero"));
        }
        Ok(())
    }
}

impl From<SessionConfig> for MasterConfig {
    fn from(session: SessionConfig) -> Self {
        Self {
            session,
            select_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::from(SessionConfig::default())
    }
}

/// Aggregated response to one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// IIN of the last fragment
    pub iin: Iin,
    pub objects: Vec<ObjectBlock>,
    pub fragments: usize,
}

impl Response {
    /// Point values carried by the response
    pub fn points(&self) -> Vec<Point> {
        self.objects.iter().flat_map(ObjectBlock::points).collect()
    }
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPhase {
    Select,
    Operate,
    /// SELECT whose OPERATE is queued by the task itself
    SelectOperate,
    Direct,
}

#[derive(Debug, Clone, Copy)]
struct ControlContext {
    phase: ControlPhase,
    index: u16,
    command: OutputCommand,
}

#[derive(Debug)]
struct PendingRequest {
    function: FunctionCode,
    objects: Vec<ObjectBlock>,
    control: Option<ControlContext>,
    reply: oneshot::Sender<Dnp3Result<Response>>,
}

#[derive(Debug)]
enum MasterCommand {
    Request(PendingRequest),
    Close(oneshot::Sender<()>),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running master session
#[derive(Debug, Clone)]
pub struct MasterHandle {
    commands: mpsc::Sender<MasterCommand>,
    state: watch::Receiver<SessionState>,
    iin: watch::Receiver<Iin>,
    points: PointReader,
    diagnostics: Diagnostics,
}

impl MasterHandle {
    /// Connect to an outstation over TCP and start the session.
    pub async fn open(config: MasterConfig) -> Dnp3Result<Self> {
        let diagnostics = Diagnostics::new(config.session.filter_level);
        Self::open_with(config, diagnostics).await
    }

    /// Like [`MasterHandle::open`], routing log output through `diagnostics`.
    pub async fn open_with(config: MasterConfig, diagnostics: Diagnostics) -> Dnp3Result<Self> {
        runtime::ensure_active()?;
        config.validate()?;
        let diagnostics = diagnostics.for_component("master");
        diagnostics.set_level(config.session.filter_level);

        let (mut machine, state) = StateMachine::new(SessionState::Closed);
        machine.apply(SessionEvent::Open)?;
        diagnostics.emit_with(FilterLevel::Info, || {
            format!("Connecting to {}", config.session.transport.endpoint())
        });

        match TcpTransport::open(&config.session.transport).await {
            Ok(transport) => {
                machine.apply(SessionEvent::OpenSucceeded)?;
                diagnostics.emit_with(FilterLevel::Info, || {
                    format!("Connected to {}", config.session.transport.endpoint())
                });
                Ok(Self::start(transport, config, machine, state, diagnostics))
            }
            Err(e) => {
                machine.apply(SessionEvent::OpenFailed)?;
                diagnostics.emit_with(FilterLevel::Error, || format!("Open failed: {}", e));
                Err(e)
            }
        }
    }

    /// Run a session over an already connected transport.
    pub fn spawn<T: Dnp3Transport>(transport: T, config: MasterConfig) -> Dnp3Result<Self> {
        let diagnostics = Diagnostics::new(config.session.filter_level);
        Self::spawn_with(transport, config, diagnostics)
    }

    pub fn spawn_with<T: Dnp3Transport>(
        transport: T,
        config: MasterConfig,
        diagnostics: Diagnostics,
    ) -> Dnp3Result<Self> {
        runtime::ensure_active()?;
        config.validate()?;
        let diagnostics = diagnostics.for_component("master");
        diagnostics.set_level(config.session.filter_level);

        let (mut machine, state) = StateMachine::new(SessionState::Closed);
        machine.apply(SessionEvent::Open)?;
        machine.apply(SessionEvent::OpenSucceeded)?;
        Ok(Self::start(transport, config, machine, state, diagnostics))
    }

    fn start<T: Dnp3Transport>(
        transport: T,
        config: MasterConfig,
        machine: StateMachine,
        state: watch::Receiver<SessionState>,
        diagnostics: Diagnostics,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (iin_tx, iin_rx) = watch::channel(Iin::default());
        let db = PointDatabase::new();
        let points = db.reader();
        let session = &config.session;
        let channel = LinkChannel::new(
            session.local_link_address,
            session.remote_link_address,
            true,
            session.max_fragment_size,
            &diagnostics,
        );

        let task = MasterTask {
            transport,
            channel,
            config,
            diagnostics: diagnostics.clone(),
            machine,
            db,
            iin: iin_tx,
            commands: commands_rx,
            queue: VecDeque::new(),
            active: None,
            seq: Sequence::default(),
            select: SelectState::new(),
            last_unsolicited: None,
        };
        tokio::spawn(task.run());

        Self {
            commands: commands_tx,
            state,
            iin: iin_rx,
            points,
            diagnostics,
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read class 1, 2, 3 events followed by all static data
    pub async fn integrity_poll(&self) -> Dnp3Result<Response> {
        let objects = vec![
            ObjectBlock::all(Variation::Group60Var2),
            ObjectBlock::all(Variation::Group60Var3),
            ObjectBlock::all(Variation::Group60Var4),
            ObjectBlock::all(Variation::Group60Var1),
        ];
        self.request(FunctionCode::Read, objects, None).await
    }

    /// Read events of the given classes
    pub async fn read_class(&self, classes: &[EventClass]) -> Dnp3Result<Response> {
        let objects = class_objects(classes)?;
        self.request(FunctionCode::Read, objects, None).await
    }

    /// Read static values for `start..=stop` of one point type
    pub async fn read_range(
        &self,
        point_type: PointType,
        start: u16,
        stop: u16,
    ) -> Dnp3Result<Response> {
        let block = ObjectBlock::range_request(Variation::any_static(point_type), start, stop)?;
        self.request(FunctionCode::Read, vec![block], None).await
    }

    /// Issue a READ with caller-built object headers
    pub async fn read(&self, objects: Vec<ObjectBlock>) -> Dnp3Result<Response> {
        self.request(FunctionCode::Read, objects, None).await
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    /// Arm an output point. The selection stays valid for `select_timeout_ms`.
    pub async fn select(&self, index: u16, command: impl Into<OutputCommand>) -> Dnp3Result<()> {
        self.control(ControlPhase::Select, FunctionCode::Select, index, command.into())
            .await
    }

    /// Execute the previously selected command.
    ///
    /// Fails locally, without sending anything, when no selection is armed,
    /// it has expired, or it names a different point or command.
    pub async fn operate(&self, index: u16, command: impl Into<OutputCommand>) -> Dnp3Result<()> {
        self.control(ControlPhase::Operate, FunctionCode::Operate, index, command.into())
            .await
    }

    /// SELECT then OPERATE as one unit.
    ///
    /// The OPERATE is sent right after the SELECT completes, ahead of any
    /// request other handles queued in the meantime.
    pub async fn select_and_operate(
        &self,
        index: u16,
        command: impl Into<OutputCommand>,
    ) -> Dnp3Result<()> {
        self.control(ControlPhase::SelectOperate, FunctionCode::Select, index, command.into())
            .await
    }

    /// Execute a command without a preceding SELECT
    pub async fn direct_operate(
        &self,
        index: u16,
        command: impl Into<OutputCommand>,
    ) -> Dnp3Result<()> {
        self.control(ControlPhase::Direct, FunctionCode::DirectOperate, index, command.into())
            .await
    }

    /// Execute a command without waiting for any response
    pub async fn direct_operate_no_ack(
        &self,
        index: u16,
        command: impl Into<OutputCommand>,
    ) -> Dnp3Result<()> {
        let block = command_block(index, &command.into())?;
        self.request(FunctionCode::DirectOperateNoAck, vec![block], None)
            .await
            .map(|_| ())
    }

    async fn control(
        &self,
        phase: ControlPhase,
        function: FunctionCode,
        index: u16,
        command: OutputCommand,
    ) -> Dnp3Result<()> {
        let block = command_block(index, &command)?;
        let context = ControlContext {
            phase,
            index,
            command,
        };
        self.request(function, vec![block], Some(context))
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Outstation management
    // ------------------------------------------------------------------------

    pub async fn enable_unsolicited(&self, classes: &[EventClass]) -> Dnp3Result<Response> {
        let objects = class_objects(classes)?;
        self.request(FunctionCode::EnableUnsolicited, objects, None)
            .await
    }

    pub async fn disable_unsolicited(&self, classes: &[EventClass]) -> Dnp3Result<Response> {
        let objects = class_objects(classes)?;
        self.request(FunctionCode::DisableUnsolicited, objects, None)
            .await
    }

    /// Synchronize the outstation clock.
    ///
    /// Measures the link delay with DELAY_MEASURE, then writes the current
    /// time corrected by that delay. Returns the one-way delay estimate.
    pub async fn sync_time(&self) -> Dnp3Result<Duration> {
        let start = Instant::now();
        let response = self
            .request(FunctionCode::DelayMeasure, Vec::new(), None)
            .await?;
        let round_trip = start.elapsed();

        let outstation_delay = response
            .objects
            .iter()
            .flat_map(|block| block.items.iter())
            .find_map(|(_, value)| match value {
                ObjectValue::Delay(ms) => Some(*ms),
                _ => None,
            })
            .ok_or_else(|| Dnp3Error::protocol("Delay measurement response without g52v2"))?;

        let delay = round_trip.saturating_sub(Duration::from_millis(u64::from(outstation_delay))) / 2;
        let time = DnpTime::now().add_millis(delay.as_millis() as u64);
        let block = ObjectBlock::count(Variation::Group50Var1, vec![ObjectValue::Time(time)])?;
        self.request(FunctionCode::Write, vec![block], None).await?;

        self.diagnostics.emit_with(FilterLevel::Info, || {
            format!("Time synchronized to {} (delay {:?})", time, delay)
        });
        Ok(delay)
    }

    /// Clear the outstation's DEVICE_RESTART indication
    pub async fn clear_restart(&self) -> Dnp3Result<()> {
        let block = ObjectBlock::range(
            Variation::Group80Var1,
            Iin::RESTART_INDEX,
            vec![ObjectValue::Binary {
                state: false,
                flags: Flags::online(),
                time: None,
            }],
        )?;
        self.request(FunctionCode::Write, vec![block], None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Point values reported by the outstation so far
    pub fn points(&self) -> &PointReader {
        &self.points
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// IIN of the most recent response from the outstation
    pub fn last_iin(&self) -> Iin {
        *self.iin.borrow()
    }

    pub fn filter_level(&self) -> FilterLevel {
        self.diagnostics.level()
    }

    /// Change the log filter at runtime; affects all layers of this session.
    pub fn set_filter_level(&self, level: FilterLevel) {
        self.diagnostics.set_level(level);
    }

    /// Close the session. Pending requests fail with `ConnectionLost`.
    pub async fn close(&self) -> Dnp3Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(MasterCommand::Close(tx)).await.is_err() {
            // Task already gone
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn request(
        &self,
        function: FunctionCode,
        objects: Vec<ObjectBlock>,
        control: Option<ControlContext>,
    ) -> Dnp3Result<Response> {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            function,
            objects,
            control,
            reply: tx,
        };
        self.commands
            .send(MasterCommand::Request(request))
            .await
            .map_err(|_| Dnp3Error::ConnectionLost)?;
        rx.await.map_err(|_| Dnp3Error::ConnectionLost)?
    }
}

fn class_objects(classes: &[EventClass]) -> Dnp3Result<Vec<ObjectBlock>> {
    if classes.is_empty() {
        return Err(Dnp3Error::configuration("At least one event class is required"));
    }
    Ok(classes
        .iter()
        .map(|class| {
            ObjectBlock::all(match class {
                EventClass::Class1 => Variation::Group60Var2,
                EventClass::Class2 => Variation::Group60Var3,
                EventClass::Class3 => Variation::Group60Var4,
            })
        })
        .collect())
}

/// Object block carrying one command.
///
/// Analog setpoints that are whole numbers within i32 go out as g41v1,
/// anything else as g41v3.
fn command_block(index: u16, command: &OutputCommand) -> Dnp3Result<ObjectBlock> {
    let (variation, value) = match *command {
        OutputCommand::Crob(crob) => (Variation::Group12Var1, ObjectValue::Crob(crob)),
        OutputCommand::Analog(analog) => {
            let integral = analog.value.fract() == 0.0
                && analog.value >= f64::from(i32::MIN)
                && analog.value <= f64::from(i32::MAX);
            let variation = if integral {
                Variation::Group41Var1
            } else {
                Variation::Group41Var3
            };
            (variation, ObjectValue::AnalogCommand(analog))
        }
    };
    ObjectBlock::prefixed(variation, vec![(index, value)])
}

// ============================================================================
// Session task
// ============================================================================

struct ActiveRequest {
    request: PendingRequest,
    seq: u8,
    fragment: Bytes,
    attempts: u32,
    deadline: Instant,
    expected_seq: u8,
    response: Response,
}

enum Wake {
    Command(Option<MasterCommand>),
    Received(Dnp3Result<Option<Bytes>>),
    Timeout,
}

struct MasterTask<T> {
    transport: T,
    channel: LinkChannel,
    config: MasterConfig,
    diagnostics: Diagnostics,
    machine: StateMachine,
    db: PointDatabase,
    iin: watch::Sender<Iin>,
    commands: mpsc::Receiver<MasterCommand>,
    queue: VecDeque<PendingRequest>,
    active: Option<ActiveRequest>,
    seq: Sequence,
    select: SelectState,
    last_unsolicited: Option<u8>,
}

impl<T: Dnp3Transport> MasterTask<T> {
    async fn run(mut self) {
        let reason = loop {
            let result = if self.active.is_none() {
                self.start_next().await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    break e;
                }
                self.diagnostics
                    .emit_with(FilterLevel::Warn, || format!("Request not sent: {}", e));
            }

            let deadline = self.active.as_ref().map(|active| active.deadline);
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                received = self.transport.receive() => Wake::Received(received),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Timeout,
            };

            let result = match wake {
                Wake::Command(Some(MasterCommand::Request(request))) => {
                    self.queue.push_back(request);
                    Ok(())
                }
                Wake::Command(Some(MasterCommand::Close(ack))) => {
                    self.diagnostics.emit(FilterLevel::Info, "Session closed");
                    self.teardown(SessionEvent::Close).await;
                    let _ = ack.send(());
                    return;
                }
                Wake::Command(None) => {
                    self.diagnostics
                        .emit(FilterLevel::Info, "All handles dropped, closing session");
                    self.teardown(SessionEvent::Close).await;
                    return;
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
            .emit_with(FilterLevel::Error, || format!("Session lost: {}", reason));
        self.teardown(SessionEvent::TransportClosed).await;
    }

    /// Send the next queued request, if any.
    async fn start_next(&mut self) -> Dnp3Result<()> {
        while let Some(request) = self.queue.pop_front() {
            // OPERATE is checked against the armed selection before anything
            // goes on the wire.
            if let Some(ctx) = request.control.filter(|c| c.phase == ControlPhase::Operate) {
                let next_seq = self.seq.value();
                let checked = self
                    .select
                    .check(ctx.index, &ctx.command, next_seq, Instant::now());
                if let Err(e) = checked {
                    self.diagnostics.emit_with(FilterLevel::Warn, || {
                        format!("OPERATE on index {} refused locally: {}", ctx.index, e)
                    });
                    let _ = request.reply.send(Err(e.into()));
                    continue;
                }
            }

            let seq = self.seq.increment();
            let fragment = match app::build(request.function, AppControl::single(seq), &request.objects) {
                Ok(fragment) => fragment,
                Err(e) => {
                    let _ = request.reply.send(Err(e));
                    continue;
                }
            };

            self.channel.send(&mut self.transport, &fragment).await?;
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!("Sent {} seq {}", request.function, seq)
            });

            if request.function == FunctionCode::DirectOperateNoAck {
                let _ = request.reply.send(Ok(Response::default()));
                continue;
            }

            self.machine.apply(SessionEvent::IssueRequest)?;
            self.active = Some(ActiveRequest {
                request,
                seq,
                fragment,
                attempts: 1,
                deadline: Instant::now() + self.config.session.response_timeout(),
                expected_seq: seq,
                response: Response::default(),
            });
            return Ok(());
        }
        Ok(())
    }

    async fn on_bytes(&mut self, bytes: &[u8]) -> Dnp3Result<()> {
        let received = self.channel.receive(bytes);
        self.channel
            .send_replies(&mut self.transport, &received.replies)
            .await?;
        for fragment in received.fragments {
            self.on_fragment(&fragment).await?;
        }
        Ok(())
    }

    async fn on_fragment(&mut self, bytes: &[u8]) -> Dnp3Result<()> {
        let fragment = match app::parse(bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.diagnostics
                    .emit_with(FilterLevel::Warn, || format!("Discarding fragment: {}", e));
                return Ok(());
            }
        };

        match fragment.function {
            FunctionCode::Response => self.on_response(fragment).await,
            FunctionCode::UnsolicitedResponse => self.on_unsolicited(fragment).await,
            other => {
                self.diagnostics.emit_with(FilterLevel::Warn, || {
                    format!("Ignoring {} sent by the outstation", other)
                });
                Ok(())
            }
        }
    }

    async fn on_response(&mut self, fragment: ParsedFragment) -> Dnp3Result<()> {
        let seq = fragment.control.seq;
        let expected = match self.active.as_ref() {
            Some(active) if active.response.fragments == 0 => fragment.control.fir.then_some(active.seq),
            Some(active) => (!fragment.control.fir).then_some(active.expected_seq),
            None => None,
        };
        if expected != Some(seq) {
            self.diagnostics.emit_with(FilterLevel::Warn, || match expected {
                Some(expected) => format!("Discarding response seq {}, expected {}", seq, expected),
                None => format!("Discarding unexpected response seq {}", seq),
            });
            if self.active.is_some() {
                self.machine.apply(SessionEvent::ResponseMismatched)?;
            }
            return Ok(());
        }

        let iin = fragment.iin.unwrap_or_default();
        self.record_iin(iin);
        let applied = self.apply_points(&fragment.objects);
        self.diagnostics.emit_with(FilterLevel::Debug, || {
            format!("Response seq {} with {} point(s), IIN {}", seq, applied, iin)
        });
        if fragment.control.con {
            self.send_confirm(seq, false).await?;
        }

        let timeout = self.config.session.response_timeout();
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.response.iin = iin;
        active.response.fragments += 1;
        active.response.objects.extend(fragment.objects);

        if fragment.control.fin {
            self.machine.apply(SessionEvent::ResponseComplete)?;
            if let Some(active) = self.active.take() {
                self.complete(active);
            }
        } else {
            active.expected_seq = Sequence::new(seq).next().value();
            active.deadline = Instant::now() + timeout;
            self.machine.apply(SessionEvent::ResponseFragment)?;
        }
        Ok(())
    }

    async fn on_unsolicited(&mut self, fragment: ParsedFragment) -> Dnp3Result<()> {
        let seq = fragment.control.seq;
        let iin = fragment.iin.unwrap_or_default();
        // A restarted outstation numbers its unsolicited responses afresh
        if iin.contains(Iin::DEVICE_RESTART) && !self.iin.borrow().contains(Iin::DEVICE_RESTART) {
            self.last_unsolicited = None;
        }
        self.record_iin(iin);

        if self.last_unsolicited == Some(seq) {
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!("Repeated unsolicited seq {}, confirming again", seq)
            });
        } else {
            let applied = self.apply_points(&fragment.objects);
            self.diagnostics.emit_with(FilterLevel::Info, || {
                format!("Unsolicited response seq {} with {} point(s)", seq, applied)
            });
        }

        self.machine.apply(SessionEvent::UnsolicitedReceived)?;
        if fragment.control.con {
            self.send_confirm(seq, true).await?;
        }
        self.last_unsolicited = Some(seq);
        Ok(())
    }

    async fn on_timeout(&mut self) -> Dnp3Result<()> {
        let retries = self.config.session.retry_count;
        let timeout = self.config.session.response_timeout();
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        if active.attempts <= retries {
            active.attempts += 1;
            active.deadline = Instant::now() + timeout;
            active.expected_seq = active.seq;
            active.response = Response::default();
            let fragment = active.fragment.clone();
            let (function, seq, retry) = (active.request.function, active.seq, active.attempts - 1);
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!("No response to {} seq {}, retry {}/{}", function, seq, retry, retries)
            });
            self.machine.apply(SessionEvent::Retry)?;
            self.channel.send(&mut self.transport, &fragment).await?;
            return Ok(());
        }

        if let Some(active) = self.active.take() {
            self.diagnostics.emit_with(FilterLevel::Error, || {
                format!(
                    "{} seq {} failed after {} attempt(s)",
                    active.request.function, active.seq, active.attempts
                )
            });
            self.machine.apply(SessionEvent::RetriesExhausted)?;
            if active.request.control.map(|c| c.phase) == Some(ControlPhase::Operate) {
                self.select.clear();
            }
            let _ = active.request.reply.send(Err(Dnp3Error::timeout(active.attempts)));
        }
        Ok(())
    }

    fn complete(&mut self, active: ActiveRequest) {
        let ActiveRequest {
            request,
            response,
            seq,
            ..
        } = active;
        let PendingRequest {
            function,
            objects,
            control,
            reply,
        } = request;
        let result = match control {
            Some(ctx) => self.complete_control(ctx, function, seq, response),
            None if response.iin.has_request_error() => Err(Dnp3Error::Rejected {
                function,
                iin: response.iin,
            }),
            None => Ok(response),
        };

        if let (Ok(_), Some(ctx)) = (&result, control) {
            if ctx.phase == ControlPhase::SelectOperate {
                // Same object bytes, next sequence number, front of the queue
                self.queue.push_front(PendingRequest {
                    function: FunctionCode::Operate,
                    objects,
                    control: Some(ControlContext {
                        phase: ControlPhase::Operate,
                        ..ctx
                    }),
                    reply,
                });
                return;
            }
        }
        let _ = reply.send(result);
    }

    fn complete_control(
        &mut self,
        ctx: ControlContext,
        function: FunctionCode,
        seq: u8,
        response: Response,
    ) -> Dnp3Result<Response> {
        let Some(status) = echoed_status(&response, &ctx) else {
            if ctx.phase != ControlPhase::Direct {
                self.select.clear();
            }
            return Err(Dnp3Error::Rejected {
                function,
                iin: response.iin,
            });
        };

        match (ctx.phase, status.is_success()) {
            (ControlPhase::Select | ControlPhase::SelectOperate, true) => {
                self.select.select(
                    ctx.index,
                    ctx.command,
                    seq,
                    self.config.select_timeout(),
                    Instant::now(),
                );
                Ok(response)
            }
            (ControlPhase::Select | ControlPhase::SelectOperate | ControlPhase::Operate, false) => {
                self.select.clear();
                Err(SelectOperateError::Rejected { status }.into())
            }
            (ControlPhase::Direct, false) => Err(Dnp3Error::CommandFailed { status }),
            (ControlPhase::Operate | ControlPhase::Direct, true) => {
                self.select.clear();
                self.apply_command(&ctx);
                Ok(response)
            }
        }
    }

    fn apply_command(&self, ctx: &ControlContext) {
        if let Some(value) = ctx.command.commanded_value() {
            let point = Point::new(ctx.index, ctx.command.point_type(), value)
                .with_timestamp(DnpTime::now());
            self.db.update(point);
            self.diagnostics.emit_with(FilterLevel::Info, || {
                format!("{}[{}] commanded to {}", point.point_type, point.index, value)
            });
        }
    }

    /// Apply every point carried by a fully parsed fragment
    fn apply_points(&self, objects: &[ObjectBlock]) -> usize {
        let points: Vec<Point> = objects.iter().flat_map(ObjectBlock::points).collect();
        if points.is_empty() {
            return 0;
        }
        self.db.apply(points)
    }

    fn record_iin(&self, iin: Iin) {
        let previous = *self.iin.borrow();
        let newly_set = |bit: u16| iin.contains(bit) && !previous.contains(bit);

        if newly_set(Iin::DEVICE_RESTART) {
            self.diagnostics
                .emit(FilterLevel::Event, "Outstation reports DEVICE_RESTART");
        }
        if newly_set(Iin::DEVICE_TROUBLE) {
            self.diagnostics
                .emit(FilterLevel::Warn, "Outstation reports DEVICE_TROUBLE");
        }
        if newly_set(Iin::EVENT_BUFFER_OVERFLOW) {
            self.diagnostics
                .emit(FilterLevel::Warn, "Outstation event buffer overflowed");
        }
        if iin.has_request_error() {
            self.diagnostics
                .emit_with(FilterLevel::Warn, || format!("Outstation rejected request: IIN {}", iin));
        }
        self.iin.send_replace(iin);
    }

    async fn send_confirm(&mut self, seq: u8, unsolicited: bool) -> Dnp3Result<()> {
        let control = AppControl {
            uns: unsolicited,
            ..AppControl::single(seq)
        };
        let fragment = app::build(FunctionCode::Confirm, control, &[])?;
        self.channel.send(&mut self.transport, &fragment).await
    }

    async fn teardown(&mut self, event: SessionEvent) {
        let _ = self.transport.close().await;
        self.select.clear();
        self.channel.reset();

        if let Some(active) = self.active.take() {
            let _ = active.request.reply.send(Err(Dnp3Error::ConnectionLost));
        }
        for request in self.queue.drain(..) {
            let _ = request.reply.send(Err(Dnp3Error::ConnectionLost));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MasterCommand::Request(request) => {
                    let _ = request.reply.send(Err(Dnp3Error::ConnectionLost));
                }
                MasterCommand::Close(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        if let Err(e) = self.machine.apply(event) {
            self.diagnostics.emit_with(FilterLevel::Debug, || e.to_string());
        }
    }
}

/// Status the outstation echoed for the commanded point
fn echoed_status(response: &Response, ctx: &ControlContext) -> Option<crate::control::CommandStatus> {
    response
        .objects
        .iter()
        .flat_map(|block| block.items.iter())
        .find_map(|(index, value)| match (value, ctx.command) {
            (ObjectValue::Crob(crob), OutputCommand::Crob(_)) if *index == ctx.index => Some(crob.status),
            (ObjectValue::AnalogCommand(analog), OutputCommand::Analog(_)) if *index == ctx.index => {
                Some(analog.status)
            }
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AnalogOutputCommand, CommandStatus, ControlRelayOutputBlock};
    use crate::point::PointValue;
    use crate::transport::StreamTransport;
    use tokio::io::DuplexStream;

    /// Scripted outstation on the far end of an in-memory pipe
    struct FakeOutstation {
        transport: StreamTransport<DuplexStream>,
        channel: LinkChannel,
        pending: VecDeque<ParsedFragment>,
    }

    impl FakeOutstation {
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

        async fn send(&mut self, fragment: Bytes) {
            self.channel.send(&mut self.transport, &fragment).await.unwrap();
        }

        async fn respond(&mut self, control: AppControl, objects: &[ObjectBlock]) {
            let fragment =
                app::build_response(FunctionCode::Response, control, Iin::default(), objects).unwrap();
            self.send(fragment).await;
        }
    }

    fn pair(config: MasterConfig) -> (MasterHandle, FakeOutstation) {
        let (a, b) = tokio::io::duplex(4096);
        let master = MasterHandle::spawn(StreamTransport::from_stream(a), config).unwrap();
        let outstation = FakeOutstation {
            transport: StreamTransport::from_stream(b),
            channel: LinkChannel::new(1024, 1, false, 2048, &Diagnostics::default()),
            pending: VecDeque::new(),
        };
        (master, outstation)
    }

    fn echo(request: &ParsedFragment, status: CommandStatus) -> Vec<ObjectBlock> {
        request
            .objects
            .iter()
            .cloned()
            .map(|mut block| {
                for (_, value) in block.items.iter_mut() {
                    if let ObjectValue::Crob(crob) = value {
                        *crob = crob.with_status(status);
                    }
                }
                block
            })
            .collect()
    }

    #[tokio::test]
    async fn test_integrity_poll_updates_database() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.integrity_poll().await }
        });

        let request = outstation.next().await;
        assert_eq!(request.function, FunctionCode::Read);
        let classes: Vec<_> = request.objects.iter().map(|b| b.variation()).collect();
        assert_eq!(
            classes,
            vec![
                Variation::Group60Var2,
                Variation::Group60Var3,
                Variation::Group60Var4,
                Variation::Group60Var1
            ]
        );

        let binaries = ObjectBlock::range(
            Variation::Group1Var2,
            0,
            vec![
                ObjectValue::from_point(&Point::binary_input(0, true)),
                ObjectValue::from_point(&Point::binary_input(1, false)),
            ],
        )
        .unwrap();
        let analogs = ObjectBlock::range(
            Variation::Group30Var5,
            0,
            vec![ObjectValue::from_point(&Point::analog_input(0, 12.5))],
        )
        .unwrap();
        outstation
            .respond(AppControl::single(request.control.seq), &[binaries, analogs])
            .await;

        let response = poll.await.unwrap().unwrap();
        assert_eq!(response.points().len(), 3);
        let points = master.points();
        assert_eq!(
            points.read(PointType::BinaryInput, 0).unwrap().value,
            PointValue::Binary(true)
        );
        assert_eq!(
            points.read(PointType::AnalogInput, 0).unwrap().value,
            PointValue::Analog(12.5)
        );
        assert_eq!(master.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_mismatched_sequence_is_discarded() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.read_class(&[EventClass::Class1]).await }
        });

        let request = outstation.next().await;
        let wrong = (request.control.seq + 5) % 16;
        let stale = ObjectBlock::range(
            Variation::Group1Var2,
            7,
            vec![ObjectValue::from_point(&Point::binary_input(7, true))],
        )
        .unwrap();
        outstation.respond(AppControl::single(wrong), &[stale]).await;
        outstation.respond(AppControl::single(request.control.seq), &[]).await;

        let response = poll.await.unwrap().unwrap();
        assert!(response.objects.is_empty());
        assert!(!master.points().contains(PointType::BinaryInput, 7));
    }

    #[tokio::test]
    async fn test_multi_fragment_response_is_confirmed() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.integrity_poll().await }
        });

        let request = outstation.next().await;
        let seq = request.control.seq;
        let first = ObjectBlock::range(
            Variation::Group1Var2,
            0,
            vec![ObjectValue::from_point(&Point::binary_input(0, true))],
        )
        .unwrap();
        let control = AppControl {
            fin: false,
            con: true,
            ..AppControl::single(seq)
        };
        outstation.respond(control, &[first]).await;

        let confirm = outstation.next().await;
        assert_eq!(confirm.function, FunctionCode::Confirm);
        assert_eq!(confirm.control.seq, seq);
        assert!(!confirm.control.uns);

        let second = ObjectBlock::range(
            Variation::Group20Var1,
            0,
            vec![ObjectValue::from_point(&Point::counter(0, 42))],
        )
        .unwrap();
        let next_seq = (seq + 1) % 16;
        let control = AppControl {
            fir: false,
            ..AppControl::single(next_seq)
        };
        outstation.respond(control, &[second]).await;

        let response = poll.await.unwrap().unwrap();
        assert_eq!(response.fragments, 2);
        assert_eq!(
            master.points().read(PointType::Counter, 0).unwrap().value,
            PointValue::Counter(42)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_timeout() {
        let config = MasterConfig::default()
            .with_retry_count(2)
            .with_response_timeout_ms(1000);
        let (master, mut outstation) = pair(config);
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.integrity_poll().await }
        });

        let first = outstation.next().await;
        let second = outstation.next().await;
        let third = outstation.next().await;
        assert_eq!(first, second);
        assert_eq!(second, third);

        let err = poll.await.unwrap().unwrap_err();
        assert!(matches!(err, Dnp3Error::Timeout { attempts: 3 }));
        assert_eq!(master.state(), SessionState::Idle);

        // Session stays usable
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.read_class(&[EventClass::Class2]).await }
        });
        let request = outstation.next().await;
        assert_ne!(request.control.seq, first.control.seq);
        outstation.respond(AppControl::single(request.control.seq), &[]).await;
        assert!(poll.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unsolicited_is_applied_and_confirmed() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let event = ObjectBlock::prefixed(
            Variation::Group2Var2,
            vec![(
                5,
                ObjectValue::from_point(&Point::binary_input(5, true).with_timestamp(DnpTime::now())),
            )],
        )
        .unwrap();
        let iin = Iin::new(Iin::DEVICE_RESTART);
        let fragment = app::build_response(
            FunctionCode::UnsolicitedResponse,
            AppControl::unsolicited(3),
            iin,
            &[event],
        )
        .unwrap();
        outstation.send(fragment).await;

        let confirm = outstation.next().await;
        assert_eq!(confirm.function, FunctionCode::Confirm);
        assert!(confirm.control.uns);
        assert_eq!(confirm.control.seq, 3);

        assert_eq!(
            master.points().read(PointType::BinaryInput, 5).unwrap().value,
            PointValue::Binary(true)
        );
        assert!(master.last_iin().contains(Iin::DEVICE_RESTART));
    }

    #[tokio::test]
    async fn test_repeated_unsolicited_seq_after_restart_is_applied() {
        let (master, mut outstation) = pair(MasterConfig::default());

        let unsolicited = |state: bool, iin: Iin| {
            let event = ObjectBlock::prefixed(
                Variation::Group2Var1,
                vec![(5, ObjectValue::from_point(&Point::binary_input(5, state)))],
            )
            .unwrap();
            app::build_response(
                FunctionCode::UnsolicitedResponse,
                AppControl::unsolicited(0),
                iin,
                &[event],
            )
            .unwrap()
        };
        let bi5 = |master: &MasterHandle| master.points().read(PointType::BinaryInput, 5).unwrap().value;

        outstation.send(unsolicited(true, Iin::default())).await;
        assert_eq!(outstation.next().await.function, FunctionCode::Confirm);
        assert_eq!(bi5(&master), PointValue::Binary(true));

        // Same seq without a restart is a retransmission
        outstation.send(unsolicited(false, Iin::default())).await;
        assert_eq!(outstation.next().await.function, FunctionCode::Confirm);
        assert_eq!(bi5(&master), PointValue::Binary(true));

        outstation
            .send(unsolicited(false, Iin::new(Iin::DEVICE_RESTART)))
            .await;
        assert_eq!(outstation.next().await.function, FunctionCode::Confirm);
        assert_eq!(bi5(&master), PointValue::Binary(false));
    }

    #[tokio::test]
    async fn test_operate_without_select_sends_nothing() {
        let (master, mut outstation) = pair(MasterConfig::default());

        let err = master
            .operate(2, ControlRelayOutputBlock::latch_on())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Dnp3Error::SelectOperate(SelectOperateError::NotSelected)
        ));

        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.read_class(&[EventClass::Class3]).await }
        });
        let request = outstation.next().await;
        assert_eq!(request.function, FunctionCode::Read);
        outstation.respond(AppControl::single(request.control.seq), &[]).await;
        poll.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_select_before_operate() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let crob = ControlRelayOutputBlock::latch_on();
        let task = tokio::spawn({
            let master = master.clone();
            async move { master.select_and_operate(3, crob).await }
        });

        let select = outstation.next().await;
        assert_eq!(select.function, FunctionCode::Select);
        let echoed = echo(&select, CommandStatus::Success);
        outstation.respond(AppControl::single(select.control.seq), &echoed).await;

        let operate = outstation.next().await;
        assert_eq!(operate.function, FunctionCode::Operate);
        assert_eq!(operate.control.seq, (select.control.seq + 1) % 16);
        assert_eq!(operate.objects, select.objects);
        let echoed = echo(&operate, CommandStatus::Success);
        outstation.respond(AppControl::single(operate.control.seq), &echoed).await;

        task.await.unwrap().unwrap();
        assert_eq!(
            master.points().read(PointType::BinaryOutput, 3).unwrap().value,
            PointValue::Binary(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_and_operate_not_split_by_other_handle() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let crob = ControlRelayOutputBlock::latch_on();
        let sbo = tokio::spawn({
            let master = master.clone();
            async move { master.select_and_operate(3, crob).await }
        });

        let select = outstation.next().await;
        assert_eq!(select.function, FunctionCode::Select);

        // Queued by another handle while the SELECT is outstanding
        let poll = tokio::spawn({
            let other = master.clone();
            async move { other.read_class(&[EventClass::Class1]).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let echoed = echo(&select, CommandStatus::Success);
        outstation.respond(AppControl::single(select.control.seq), &echoed).await;

        let operate = outstation.next().await;
        assert_eq!(operate.function, FunctionCode::Operate);
        assert_eq!(operate.control.seq, (select.control.seq + 1) % 16);
        assert_eq!(operate.objects, select.objects);
        let echoed = echo(&operate, CommandStatus::Success);
        outstation.respond(AppControl::single(operate.control.seq), &echoed).await;

        let read = outstation.next().await;
        assert_eq!(read.function, FunctionCode::Read);
        outstation.respond(AppControl::single(read.control.seq), &[]).await;

        sbo.await.unwrap().unwrap();
        poll.await.unwrap().unwrap();
        assert_eq!(
            master.points().read(PointType::BinaryOutput, 3).unwrap().value,
            PointValue::Binary(true)
        );
    }

    #[tokio::test]
    async fn test_operate_after_interleaved_request_fails_locally() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let crob = ControlRelayOutputBlock::latch_on();

        let task = tokio::spawn({
            let master = master.clone();
            async move { master.select(3, crob).await }
        });
        let select = outstation.next().await;
        let echoed = echo(&select, CommandStatus::Success);
        outstation.respond(AppControl::single(select.control.seq), &echoed).await;
        task.await.unwrap().unwrap();

        let task = tokio::spawn({
            let other = master.clone();
            async move { other.read_class(&[EventClass::Class2]).await }
        });
        let read = outstation.next().await;
        outstation.respond(AppControl::single(read.control.seq), &[]).await;
        task.await.unwrap().unwrap();

        let err = master.operate(3, crob).await.unwrap_err();
        assert!(matches!(
            err,
            Dnp3Error::SelectOperate(SelectOperateError::OutOfSequence { select_seq, operate_seq })
                if select_seq == select.control.seq && operate_seq == (select_seq + 2) % 16
        ));

        // Nothing was sent for the refused OPERATE
        let task = tokio::spawn({
            let master = master.clone();
            async move { master.read_class(&[EventClass::Class3]).await }
        });
        let next = outstation.next().await;
        assert_eq!(next.function, FunctionCode::Read);
        outstation.respond(AppControl::single(next.control.seq), &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_select_status() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let task = tokio::spawn({
            let master = master.clone();
            async move { master.select(9, ControlRelayOutputBlock::latch_off()).await }
        });

        let select = outstation.next().await;
        let echoed = echo(&select, CommandStatus::NotSupported);
        outstation.respond(AppControl::single(select.control.seq), &echoed).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Dnp3Error::SelectOperate(SelectOperateError::Rejected {
                status: CommandStatus::NotSupported
            })
        ));
    }

    #[test]
    fn test_analog_command_variation() {
        let block = command_block(1, &AnalogOutputCommand::new(100.0).into()).unwrap();
        assert_eq!(block.variation(), Variation::Group41Var1);
        let block = command_block(1, &AnalogOutputCommand::new(42.5).into()).unwrap();
        assert_eq!(block.variation(), Variation::Group41Var3);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_requests() {
        let (master, mut outstation) = pair(MasterConfig::default());
        let poll = tokio::spawn({
            let master = master.clone();
            async move { master.integrity_poll().await }
        });
        outstation.next().await;
        drop(outstation);

        let err = poll.await.unwrap().unwrap_err();
        assert!(matches!(err, Dnp3Error::ConnectionLost));

        let mut state = master.subscribe_state();
        state
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .unwrap();
        assert!(matches!(
            master.integrity_poll().await,
            Err(Dnp3Error::ConnectionLost)
        ));
    }
}
