// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the RMQT wire codec
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 property tests
//!
//! TEST_SCENARIOS:
//!   - size_survives_word_conversion(): size_bytes == size_words * word_size
//!   - header_decodes_to_what_was_encoded(): both byte orders
//!   - control_body_decodes_to_what_was_encoded(): LOCATE/LOCATE_ACK bodies
//!
//! DEPENDENCIES:
//!   - proptest: value generation

use nexus_hal::Endianness;
use nexus_rmqt::wire::{
    bytes_to_words, words_to_bytes, ControlBody, MsgHeader, WireError, CONTROL_SIZE, HEADER_SIZE,
};
use proptest::prelude::*;

fn endianness() -> impl Strategy<Value = Endianness> {
    prop_oneof![Just(Endianness::Little), Just(Endianness::Big)]
}

fn word_size() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(2), Just(4)]
}

proptest! {
    #[test]
    fn size_survives_word_conversion(words in 0u16..=u16::MAX, word in word_size(), extra in 1usize..4) {
        let bytes = words_to_bytes(words, word);
        prop_assert_eq!(bytes, usize::from(words) * word);
        prop_assert_eq!(bytes_to_words(bytes, word), Ok(words));
        if extra % word != 0 {
            prop_assert_eq!(
                bytes_to_words(bytes + extra, word),
                Err(WireError::NotWordMultiple { bytes: bytes + extra, word_size: word })
            );
        }
    }

    #[test]
    fn header_decodes_to_what_was_encoded(
        endian in endianness(),
        fields in prop::array::uniform8(any::<u16>()),
    ) {
        let header = MsgHeader {
            mqt_id: fields[0],
            size_words: fields[1],
            dst_id: fields[2],
            src_id: fields[3],
            mqa_id: fields[4],
            msg_id: fields[5],
            reply_id: fields[6],
            flags: fields[7],
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(endian, &mut buf).unwrap();
        prop_assert_eq!(MsgHeader::decode(endian, &buf).unwrap(), header);
    }

    #[test]
    fn control_body_decodes_to_what_was_encoded(
        endian in endianness(),
        ids in (any::<u16>(), any::<u16>()),
        words in prop::array::uniform4(any::<u32>()),
        found in any::<bool>(),
    ) {
        let body = ControlBody {
            queue_id: ids.0,
            mqa_id: ids.1,
            timeout: words[0],
            reply_handle: words[1],
            arg: words[2],
            sem_handle: words[3],
            msgq_found: found,
        };
        let mut buf = [0u8; CONTROL_SIZE];
        body.encode(endian, &mut buf).unwrap();
        prop_assert_eq!(ControlBody::decode(endian, &buf).unwrap(), body);
    }
}
