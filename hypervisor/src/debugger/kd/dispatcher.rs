//! Serves the remote debugger while the system is halted.

use {
    crate::{
        debugger::{
            breakpoints,
            broadcast::{HaltedCoreTask, TaskResult},
            disassembler::{guest_bitness, guest_instruction_bytes, instruction_length},
            events::{self, EventStage, APPLY_TO_ALL},
            kd::{
                commands::*,
                packet::{Packet, PacketReader, PacketType, RequestedAction},
                requests,
                transport::Transport,
            },
            script::{host::ExitScriptHost, Script},
            session::{self, HaltHandler, HaltInfo, HaltOutcome, PausingReason, SwitchTarget},
            stepping::{self, StepKind},
        },
        error::{status_of, DebuggerErrorCode, HypervisorError},
        intel::{events::EventInjection, registers::GuestRegisters, vmexit::VmExitContext},
        platform::Platform,
        CoreState,
    },
    alloc::{boxed::Box, collections::VecDeque, vec::Vec},
    spin::Mutex,
    zerocopy::IntoBytes,
};

/// Messages sent in one batch before the debugger gets control.
const MAX_MESSAGES_PER_BATCH: usize = 256;

const SUCCESS: u32 = DebuggerErrorCode::Success as u32;

/// The serial line and what has been read from it.
struct Link {
    transport: Box<dyn Transport>,
    reader: PacketReader,
    /// Requests that arrived while the system was running.
    pending: VecDeque<Packet>,
    base64: bool,
}

impl Link {
    fn send(&mut self, platform: &dyn Platform, packet_type: PacketType, action: RequestedAction, payload: Vec<u8>) -> Result<(), HypervisorError> {
        let frame = Packet::new(packet_type, action, payload).encode(self.base64);
        self.transport.send(platform, &frame)
    }

    fn reply(&mut self, platform: &dyn Platform, action: RequestedAction, payload: Vec<u8>) -> Result<(), HypervisorError> {
        self.send(platform, PacketType::DebuggeeToDebugger, action, payload)
    }

    /// Waits for the next complete request.
    fn next_request(&mut self, platform: &dyn Platform) -> Result<Packet, HypervisorError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(packet);
        }

        loop {
            let Some(byte) = self.transport.receive(platform)? else {
                continue;
            };

            match self.reader.push(byte) {
                Some(Ok(packet)) => return Ok(packet),
                Some(Err(HypervisorError::LinkDown)) => return Err(HypervisorError::LinkDown),
                Some(Err(error)) => log::warn!("Dropped packet: {}", error),
                None => {}
            }
        }
    }

    fn send_messages(&mut self, platform: &dyn Platform, state: &CoreState) -> Result<(), HypervisorError> {
        for message in state.messages.drain(MAX_MESSAGES_PER_BATCH) {
            let header = LogPacket { tag: message.tag, dropped: state.messages.dropped() };
            self.reply(platform, RequestedAction::LoggingMechanism, join(&header, message.text.as_bytes()))?;
        }
        Ok(())
    }
}

/// The debugger on the other end of a serial line.
pub struct KdDebugger {
    link: Mutex<Link>,
    user_input: Mutex<VecDeque<Vec<u8>>>,
}

impl KdDebugger {
    /// # Arguments
    ///
    /// * `transport` - The line to the debugger.
    /// * `base64` - Encode frames so payloads may contain the end marker.
    pub fn new(transport: Box<dyn Transport>, base64: bool) -> Self {
        Self {
            link: Mutex::new(Link { transport, reader: PacketReader::new(), pending: VecDeque::new(), base64 }),
            user_input: Mutex::new(VecDeque::new()),
        }
    }

    /// Announces the debuggee. Sent once the processors run virtualized.
    pub fn start(&self, platform: &dyn Platform) -> Result<(), HypervisorError> {
        let started = StartedPacket { version: PROTOCOL_VERSION, processor_count: platform.processor_count() };
        self.link.lock().reply(platform, RequestedAction::Started, started.as_bytes().to_vec())
    }

    /// Tells the debugger the system is going down.
    pub fn report_crash(&self, platform: &dyn Platform, rip: u64, message: &str) {
        let header = CrashPacket { core: platform.current_core(), rip, message_length: message.len() as u32 };
        let payload = join(&header, message.as_bytes());

        // The crash path cannot wait for a processor that holds the line.
        let Some(mut link) = self.link.try_lock() else {
            return;
        };
        if let Err(error) = link.send(platform, PacketType::DebuggeeCrash, RequestedAction::NoAction, payload) {
            log::error!("Crash report not delivered: {}", error);
        }
    }

    /// Text the debugger sent for the guest, oldest first.
    pub fn take_user_input(&self) -> Option<Vec<u8>> {
        self.user_input.lock().pop_front()
    }

    /// Registers of `core`, read on that processor when it is parked.
    fn registers_of(ctx: &mut VmExitContext<'_>, core: u32) -> Result<GuestRegisters, HypervisorError> {
        if core == ctx.core() {
            return Ok(ctx.registers.clone());
        }

        let state = ctx.state;
        match state.session.tasks().run_on(ctx, core, HaltedCoreTask::ReadRegisters)? {
            TaskResult::Registers(registers) => Ok(*registers),
            _ => Err(HypervisorError::DebuggerBusy),
        }
    }

    fn report_pause(link: &mut Link, ctx: &mut VmExitContext<'_>, info: &HaltInfo) -> Result<(), HypervisorError> {
        let platform = ctx.platform;

        let mut registers = Vec::new();
        for core in ctx.state.session.halted_cores() {
            match Self::registers_of(ctx, core) {
                Ok(values) => registers.push(RegisterState::capture(core, &values)),
                Err(error) => log::warn!("No registers from processor {}: {}", core, error),
            }
        }

        let bitness = guest_bitness(platform);
        let rip = ctx.registers.rip;
        let bytes = guest_instruction_bytes(platform, ctx.guest_cr3(), rip);
        let mut instruction_bytes = [0u8; PAUSED_INSTRUCTION_BYTES];
        let copied = bytes.len().min(PAUSED_INSTRUCTION_BYTES);
        instruction_bytes[..copied].copy_from_slice(&bytes[..copied]);

        let process = platform.process_info();
        let header = PausedPacket {
            reason: info.reason as u32,
            core: info.core,
            tag: info.tag,
            context: info.context,
            rip,
            is_32bit: u8::from(bitness == 32),
            instruction_length: instruction_length(&bytes, bitness).unwrap_or(0) as u8,
            instruction_bytes,
            pid: process.pid,
            tid: process.tid,
            register_count: registers.len() as u32,
        };

        link.reply(platform, RequestedAction::Paused, join(&header, registers.as_bytes()))
    }

    /// Serves one request. `Some` ends the halt.
    fn serve(&self, link: &mut Link, ctx: &mut VmExitContext<'_>, info: &HaltInfo, packet: Packet) -> Result<Option<HaltOutcome>, HypervisorError> {
        let platform = ctx.platform;
        let state = ctx.state;

        if packet.packet_type != PacketType::DebuggerToDebuggee {
            log::warn!("Ignoring {:?} packet", packet.packet_type);
            return Ok(None);
        }

        let action = packet.action;
        let payload = packet.payload.as_slice();
        log::trace!("Serving {:?}", action);

        if let Some(reply) = requests::execute(platform, state, ctx.guest_cr3(), action, payload) {
            link.reply(platform, action.result(), reply?)?;
            return Ok(None);
        }

        match action {
            RequestedAction::Pause => Ok(None),
            RequestedAction::Continue => Ok(Some(HaltOutcome::Continue)),
            RequestedAction::Step => {
                let (request, _) = split::<StepPacket>(payload)?;
                let result = StepKind::from_u32(request.step_type).and_then(|kind| stepping::start(ctx, kind));
                link.reply(platform, action.result(), StatusPacket { status: status_of(&result) }.as_bytes().to_vec())?;
                Ok(result.is_ok().then_some(HaltOutcome::Continue))
            }
            RequestedAction::CloseAndUnload => {
                log::info!("Debugger closed the session");
                events::clear_all(platform, state);
                breakpoints::clear_all(platform, state);
                session::cancel_switch(platform, state);
                state.session.set_handler(None);
                Ok(Some(HaltOutcome::Continue))
            }
            RequestedAction::ChangeCore => {
                let (mut request, _) = split::<ChangeCorePacket>(payload)?;
                let target = request.core;
                let valid = target == ctx.core() || (target < platform.processor_count() && state.session.is_halted(target));

                request.status = if valid { SUCCESS } else { DebuggerErrorCode::InvalidCoreId as u32 };
                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok((valid && target != ctx.core()).then_some(HaltOutcome::SwitchCore(target)))
            }
            RequestedAction::ChangeProcess | RequestedAction::ChangeThread => {
                let (mut request, _) = split::<ChangeContextPacket>(payload)?;
                let is_process = action == RequestedAction::ChangeProcess;

                if request.switch == 0 {
                    let process = platform.process_info();
                    request.id = if is_process { process.pid } else { process.tid };
                    request.process = process.process;
                    request.thread = process.thread;
                    request.name = process.name;
                    request.status = SUCCESS;
                    link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                    return Ok(None);
                }

                let target = if is_process { SwitchTarget::Process(request.id) } else { SwitchTarget::Thread(request.id) };
                let result = session::request_switch(platform, state, target);
                request.status = status_of(&result);
                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok(result.is_ok().then_some(HaltOutcome::Continue))
            }
            RequestedAction::ReadRegisters => {
                let (request, _) = split::<ReadRegistersPacket>(payload)?;
                let cores = match { request.core } {
                    APPLY_TO_ALL => state.session.halted_cores(),
                    core => alloc::vec![core],
                };

                let mut status = SUCCESS;
                let mut registers = Vec::new();
                for core in cores {
                    if core >= platform.processor_count() {
                        status = DebuggerErrorCode::InvalidCoreId as u32;
                        continue;
                    }
                    match Self::registers_of(ctx, core) {
                        Ok(values) => registers.push(RegisterState::capture(core, &values)),
                        Err(error) => status = DebuggerErrorCode::from(error) as u32,
                    }
                }

                link.reply(platform, action.result(), join(&StatusPacket { status }, registers.as_bytes()))?;
                Ok(None)
            }
            RequestedAction::WriteRegister => {
                let (mut request, _) = split::<WriteRegisterPacket>(payload)?;
                let value = request.value;

                request.status = match { request.register } {
                    register @ 0..=15 => {
                        ctx.registers.set_gpr(register as u8, value);
                        SUCCESS
                    }
                    REGISTER_RIP => {
                        ctx.registers.rip = value;
                        SUCCESS
                    }
                    REGISTER_RFLAGS => {
                        ctx.registers.rflags = value;
                        SUCCESS
                    }
                    _ => DebuggerErrorCode::InvalidRegisterNumber as u32,
                };

                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok(None)
            }
            RequestedAction::RunScript => {
                let (mut request, tail) = split::<RunScriptPacket>(payload)?;
                let blob = tail.get(..request.script_length as usize).ok_or(HypervisorError::ProtocolMismatch)?;
                let budget = state.config.script_max_instructions;

                let result = Script::parse(blob).and_then(|script| {
                    let mut host = ExitScriptHost::new(&mut *ctx, 0, EventStage::Pre, 0, None, true);
                    script.run(&mut host, budget).map_err(HypervisorError::from)
                });

                request.status = status_of(&result);
                request.return_value = result.map_or(0, |output| output.return_value);
                link.send_messages(platform, state)?;
                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok(None)
            }
            RequestedAction::SetShortCircuitingState => {
                let (mut request, _) = split::<ShortCircuitPacket>(payload)?;

                request.status = match (info.reason, state.events.find(info.tag)) {
                    (PausingReason::EventTriggered, Some(event)) if event.stage == EventStage::Post => {
                        DebuggerErrorCode::ShortCircuitingStateIsInvalidForPostEvents as u32
                    }
                    (PausingReason::EventTriggered, Some(_)) => {
                        ctx.vcpu.debugger_short_circuit = Some(request.short_circuit != 0);
                        SUCCESS
                    }
                    _ => DebuggerErrorCode::TagNotExists as u32,
                };

                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok(None)
            }
            RequestedAction::InjectPageFault => {
                let (mut request, _) = split::<PageFaultPacket>(payload)?;
                EventInjection::inject_pf(platform, request.address, request.error_code);
                request.status = SUCCESS;
                link.reply(platform, action.result(), request.as_bytes().to_vec())?;
                Ok(None)
            }
            RequestedAction::UserInputBuffer => {
                self.user_input.lock().push_back(payload.to_vec());
                link.reply(platform, action.result(), StatusPacket { status: SUCCESS }.as_bytes().to_vec())?;
                Ok(None)
            }
            _ => Err(HypervisorError::ProtocolMismatch),
        }
    }
}

impl HaltHandler for KdDebugger {
    fn on_halt(&self, ctx: &mut VmExitContext<'_>, info: &HaltInfo) -> HaltOutcome {
        let platform = ctx.platform;
        let mut link = self.link.lock();

        if let Err(error) = link.send_messages(platform, ctx.state).and_then(|_| Self::report_pause(&mut link, ctx, info)) {
            log::warn!("Debugger unreachable ({}), continuing", error);
            return HaltOutcome::Continue;
        }

        loop {
            let packet = match link.next_request(platform) {
                Ok(packet) => packet,
                Err(error) => {
                    log::warn!("Debugger unreachable ({}), continuing", error);
                    return HaltOutcome::Continue;
                }
            };

            let action = packet.action;
            match self.serve(&mut link, ctx, info, packet) {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(HypervisorError::LinkDown) => {
                    log::warn!("Debugger link lost, continuing");
                    return HaltOutcome::Continue;
                }
                Err(error) => {
                    log::warn!("{:?} failed: {}", action, error);
                    let status = StatusPacket { status: DebuggerErrorCode::from(error) as u32 };
                    if link.reply(platform, RequestedAction::ResultOfUnknownRequest, status.as_bytes().to_vec()).is_err() {
                        return HaltOutcome::Continue;
                    }
                }
            }
        }
    }

    /// Looks for a pause request without waiting. Other requests are kept for the next halt.
    fn pause_requested(&self, ctx: &VmExitContext<'_>) -> bool {
        let platform = ctx.platform;
        let Some(mut link) = self.link.try_lock() else {
            return false;
        };

        if ctx.state.messages.has_urgent() {
            if let Err(error) = link.send_messages(platform, ctx.state) {
                log::trace!("Messages not delivered: {}", error);
            }
        }

        while link.transport.has_input(platform) {
            let byte = match link.transport.receive(platform) {
                Ok(Some(byte)) => byte,
                _ => break,
            };

            match link.reader.push(byte) {
                Some(Ok(packet)) if packet.action == RequestedAction::Pause => return true,
                Some(Ok(packet)) => link.pending.push_back(packet),
                Some(Err(error)) => log::warn!("Dropped packet: {}", error),
                None => {}
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::{
                events::{tests::setup, EventDescriptor, EventType},
                kd::transport::LoopbackSerial,
                script::{Opcode, ScriptBuilder},
            },
            intel::vcpu::VcpuState,
            platform::mock::MockPlatform,
        },
        alloc::{sync::Arc, vec},
        zerocopy::FromZeros,
    };

    fn attach(state: &CoreState) -> (Arc<KdDebugger>, LoopbackSerial) {
        let (debuggee, debugger) = LoopbackSerial::pair();
        let kd = Arc::new(KdDebugger::new(Box::new(debuggee), false));
        state.session.set_handler(Some(kd.clone()));
        (kd, debugger)
    }

    fn request(debugger: &LoopbackSerial, action: RequestedAction, payload: Vec<u8>) {
        debugger.inject(&Packet::new(PacketType::DebuggerToDebuggee, action, payload).encode(false));
    }

    fn replies(debugger: &LoopbackSerial) -> Vec<Packet> {
        PacketReader::new().feed(&debugger.take_received()).into_iter().map(|packet| packet.unwrap()).collect()
    }

    fn halt_once(platform: &MockPlatform, state: &CoreState, registers: &mut GuestRegisters, reason: PausingReason) {
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut ctx = VmExitContext::new(platform, state, &mut vcpu, registers);
        session::halt(&mut ctx, reason, 0, 0x1000);
    }

    #[test]
    fn test_halt_reports_and_serves_until_continue() {
        let (platform, state) = setup(1);
        let (_kd, debugger) = attach(&state);

        request(&debugger, RequestedAction::ReadRegisters, ReadRegistersPacket { core: 0 }.as_bytes().to_vec());
        request(&debugger, RequestedAction::Continue, vec![]);

        let mut registers = GuestRegisters { rax: 0x1234, rip: 0x4000, ..Default::default() };
        halt_once(&platform, &state, &mut registers, PausingReason::SoftwareBreakpointHit);

        let replies = replies(&debugger);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].action, RequestedAction::Paused);

        let (paused, tail) = split::<PausedPacket>(&replies[0].payload).unwrap();
        assert_eq!({ paused.reason }, PausingReason::SoftwareBreakpointHit as u32);
        assert_eq!({ paused.context }, 0x1000);
        assert_eq!({ paused.register_count }, 1);
        let (state_of_core, _) = split::<RegisterState>(tail).unwrap();
        assert_eq!({ state_of_core.rip }, 0x4000);

        assert_eq!(replies[1].action, RequestedAction::ResultOfReadingRegisters);
        let (status, tail) = split::<StatusPacket>(&replies[1].payload).unwrap();
        assert_eq!({ status.status }, SUCCESS);
        let (core_state, _) = split::<RegisterState>(tail).unwrap();
        assert_eq!({ core_state.rax }, 0x1234);

        assert_eq!(state.session.owner(), None);
    }

    #[test]
    fn test_lost_link_resumes_the_debuggee() {
        let (platform, state) = setup(1);
        let (_kd, debugger) = attach(&state);

        let mut registers = GuestRegisters::default();
        halt_once(&platform, &state, &mut registers, PausingReason::Pause);

        assert_eq!(replies(&debugger)[0].action, RequestedAction::Paused);
        assert_eq!(state.session.owner(), None);
    }

    #[test]
    fn test_register_writes_and_bad_register() {
        let (platform, state) = setup(1);
        let (_kd, debugger) = attach(&state);

        let write = |register, value| WriteRegisterPacket { register, value, status: 0 }.as_bytes().to_vec();
        request(&debugger, RequestedAction::WriteRegister, write(0, 0xAA));
        request(&debugger, RequestedAction::WriteRegister, write(REGISTER_RIP, 0x5000));
        request(&debugger, RequestedAction::WriteRegister, write(40, 1));
        request(&debugger, RequestedAction::Continue, vec![]);

        let mut registers = GuestRegisters::default();
        halt_once(&platform, &state, &mut registers, PausingReason::Pause);
        assert_eq!(registers.rax, 0xAA);
        assert_eq!(registers.rip, 0x5000);

        let replies = replies(&debugger);
        let (bad, _) = split::<WriteRegisterPacket>(&replies[3].payload).unwrap();
        assert_eq!({ bad.status }, DebuggerErrorCode::InvalidRegisterNumber as u32);
    }

    #[test]
    fn test_invalid_core_and_unknown_request() {
        let (platform, state) = setup(1);
        let (_kd, debugger) = attach(&state);

        request(&debugger, RequestedAction::ChangeCore, ChangeCorePacket { core: 7, status: 0 }.as_bytes().to_vec());
        request(&debugger, RequestedAction::ResultOfStep, vec![]);
        request(&debugger, RequestedAction::Continue, vec![]);

        let mut registers = GuestRegisters::default();
        halt_once(&platform, &state, &mut registers, PausingReason::Pause);

        let replies = replies(&debugger);
        let (change, _) = split::<ChangeCorePacket>(&replies[1].payload).unwrap();
        assert_eq!({ change.status }, DebuggerErrorCode::InvalidCoreId as u32);
        assert_eq!(replies[2].action, RequestedAction::ResultOfUnknownRequest);
    }

    #[test]
    fn test_pause_request_is_detected_and_other_requests_wait() {
        let (platform, state) = setup(1);
        let (kd, debugger) = attach(&state);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        assert!(!kd.pause_requested(&ctx));

        request(&debugger, RequestedAction::QueryVersion, vec![]);
        assert!(!kd.pause_requested(&ctx));
        assert_eq!(kd.link.lock().pending.len(), 1);

        request(&debugger, RequestedAction::Pause, vec![]);
        assert!(kd.pause_requested(&ctx));
    }

    #[test]
    fn test_short_circuit_only_for_pre_events() {
        let (platform, state) = setup(1);
        let (kd, debugger) = attach(&state);

        let mut post = EventDescriptor::new(EventType::CpuidInstructionExecution);
        post.stage = EventStage::Post;
        let post_tag = events::register_event(&platform, &state, post, vec![]).unwrap();
        let pre_tag = events::register_event(&platform, &state, EventDescriptor::new(EventType::CpuidInstructionExecution), vec![]).unwrap();

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        for tag in [post_tag, pre_tag] {
            request(&debugger, RequestedAction::SetShortCircuitingState, ShortCircuitPacket { short_circuit: 1, status: 0 }.as_bytes().to_vec());
            request(&debugger, RequestedAction::Continue, vec![]);
            let info = HaltInfo { reason: PausingReason::EventTriggered, core: 0, tag, context: 0 };
            assert_eq!(kd.on_halt(&mut ctx, &info), HaltOutcome::Continue);
        }

        let replies = replies(&debugger);
        let (post_reply, _) = split::<ShortCircuitPacket>(&replies[1].payload).unwrap();
        assert_eq!({ post_reply.status }, DebuggerErrorCode::ShortCircuitingStateIsInvalidForPostEvents as u32);
        let (pre_reply, _) = split::<ShortCircuitPacket>(&replies[3].payload).unwrap();
        assert_eq!({ pre_reply.status }, SUCCESS);
        assert_eq!(ctx.vcpu.debugger_short_circuit, Some(true));
    }

    #[test]
    fn test_run_script_and_user_input() {
        let (platform, state) = setup(1);
        let (kd, debugger) = attach(&state);

        let blob = ScriptBuilder::new().op(Opcode::Sub).num(3).num(10).return_value().build();
        let mut header = RunScriptPacket::new_zeroed();
        header.script_length = blob.len() as u32;
        request(&debugger, RequestedAction::RunScript, join(&header, &blob));
        request(&debugger, RequestedAction::UserInputBuffer, b"lm".to_vec());
        request(&debugger, RequestedAction::Continue, vec![]);

        let mut registers = GuestRegisters::default();
        halt_once(&platform, &state, &mut registers, PausingReason::Pause);

        let replies = replies(&debugger);
        let (script, _) = split::<RunScriptPacket>(&replies[1].payload).unwrap();
        assert_eq!({ script.status }, SUCCESS);
        assert_eq!({ script.return_value }, 7);
        assert_eq!(kd.take_user_input().as_deref(), Some(&b"lm"[..]));
    }

    #[test]
    fn test_close_detaches() {
        let (platform, state) = setup(1);
        let (_kd, debugger) = attach(&state);
        events::register_event(&platform, &state, EventDescriptor::new(EventType::CpuidInstructionExecution), vec![]).unwrap();

        request(&debugger, RequestedAction::CloseAndUnload, vec![]);
        let mut registers = GuestRegisters::default();
        halt_once(&platform, &state, &mut registers, PausingReason::Pause);

        assert!(state.events.is_empty());
        assert!(!state.session.is_attached());
    }
}
