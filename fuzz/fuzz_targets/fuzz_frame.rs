#![no_main]
use libfuzzer_sys::fuzz_target;
use shinesniff::codec;

// Walk an arbitrary byte stream the way a flow decoder frames it.
fuzz_target!(|data: &[u8]| {
    let mut offset = 0usize;
    while let Some((length, class)) = codec::packet_boundary(offset, data) {
        let header = class.header_size();
        let Some(end) = offset.checked_add(header + length) else {
            break;
        };
        if end > data.len() {
            break;
        }
        if length == 0 {
            offset += header;
            continue;
        }
        let _ = codec::decode_packet(class, length, &data[offset + header..end]);
        offset = end;
    }
});
