#![no_main]

use harmoniq_rtmem::fuzz::fuzz_ring_ops;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    fuzz_ring_ops(data);
});
