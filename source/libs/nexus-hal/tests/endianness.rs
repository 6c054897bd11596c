//! CONTEXT: Tests for DSP byte-order helpers and the IrqGuard critical section
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCENARIOS:
//!   - control_words_roundtrip_in_both_orders(): u16/u32 encode/decode per order
//!   - convert_elements_swaps_only_full_elements(): loader section swapping
//!   - host_order_matches_target(): host() reflects target_endian
//!
//! DEPENDENCIES:
//!   - nexus_hal::Endianness

use nexus_hal::Endianness;

#[test]
fn control_words_roundtrip_in_both_orders() {
    for order in [Endianness::Little, Endianness::Big] {
        assert_eq!(order.u16_from(order.u16_to(0xC0C0)), 0xC0C0);
        assert_eq!(order.u32_from(order.u32_to(0xBABA_0001)), 0xBABA_0001);
    }
    assert_eq!(Endianness::Big.u32_to(0x0102_0304), [1, 2, 3, 4]);
    assert_eq!(Endianness::Little.u32_to(0x0102_0304), [4, 3, 2, 1]);
}

#[test]
fn convert_elements_swaps_only_full_elements() {
    let mut data = [1u8, 2, 3, 4, 5, 6, 7];
    Endianness::Little.convert_elements(Endianness::Big, 2, &mut data);
    assert_eq!(data, [2, 1, 4, 3, 6, 5, 7]);

    let mut same = [1u8, 2, 3, 4];
    Endianness::Big.convert_elements(Endianness::Big, 4, &mut same);
    assert_eq!(same, [1, 2, 3, 4]);
}

#[test]
fn host_order_matches_target() {
    let expected = if cfg!(target_endian = "big") { Endianness::Big } else { Endianness::Little };
    assert_eq!(Endianness::host(), expected);
}
