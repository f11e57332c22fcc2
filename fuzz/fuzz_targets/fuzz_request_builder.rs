#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_dnp3::app::{self, AppControl};
use voltage_dnp3::object::{ObjectBlock, ObjectValue};
use voltage_dnp3::{ControlRelayOutputBlock, FunctionCode, OpType, Variation};

#[derive(Debug, Arbitrary)]
struct Input {
    seq: u8,
    start: u16,
    stop: u16,
    index: u16,
    count: u8,
    on_time: u32,
    off_time: u32,
    latch: bool,
}

fuzz_target!(|input: Input| {
    if let Ok(block) = ObjectBlock::range_request(Variation::Group30Var0, input.start, input.stop) {
        let fragment = app::build(FunctionCode::Read, AppControl::single(input.seq), &[block]).unwrap();
        let parsed = app::parse(&fragment).unwrap();
        assert_eq!(parsed.control.seq, input.seq & 0x0F);
    }

    let mut crob = ControlRelayOutputBlock::new(if input.latch { OpType::LatchOn } else { OpType::PulseOn });
    crob.count = input.count;
    crob.on_time_ms = input.on_time;
    crob.off_time_ms = input.off_time;
    let block = ObjectBlock::prefixed(Variation::Group12Var1, vec![(input.index, ObjectValue::Crob(crob))]).unwrap();
    let fragment = app::build(FunctionCode::Select, AppControl::single(input.seq), &[block.clone()]).unwrap();
    let parsed = app::parse(&fragment).unwrap();
    assert_eq!(parsed.objects, vec![block]);
});
