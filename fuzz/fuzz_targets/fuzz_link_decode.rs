#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_dnp3::segment::LinkChannel;
use voltage_dnp3::{Diagnostics, FilterLevel};

// Arbitrary bytes split into two reads must never panic the link channel,
// and every frame it accepts must fit the fragment limit.
fuzz_target!(|data: &[u8]| {
    let diagnostics = Diagnostics::new(FilterLevel::Emerg);
    let mut channel = LinkChannel::new(1024, 1, false, 2048, &diagnostics);
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (head, tail) = data.split_at(split);
    for chunk in [head, tail] {
        let received = channel.receive(chunk);
        for fragment in received.fragments {
            assert!(fragment.len() <= 2048);
        }
    }
});
