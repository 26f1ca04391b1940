#![no_main]
use libfuzzer_sys::fuzz_target;
use shinesniff::protocol::LinkType;

fuzz_target!(|data: &[u8]| {
    let _ = shinesniff::protocol::parse_tcp(data, LinkType::Ethernet);
    let _ = shinesniff::protocol::parse_tcp(data, LinkType::LinuxSll);
});
