//! Chunk layout over a range of inputs.

mod common;

use common::document;
use tkg_ingest::pipeline::chunker::chunk_document;

const SAMPLES: &[&str] = &[
    "Acme Corp acquired Beta Inc in 2020. In 2023, Acme Corp sold Beta Inc.",
    "One sentence without a full stop",
    "Trailing whitespace after the last sentence.   \n\n",
    "Zürich, São Paulo and Kraków all opened offices! Did revenue grow? It did.",
    "averyveryverylongtokenwithoutanyspaceswhatsoeverthatmustbecutsomewhere and then some words",
    "  Leading space. Then more.",
];

#[test]
fn chunks_tile_the_document_in_order() {
    for max in [16, 24, 40, 1_000] {
        for text in SAMPLES {
            let doc = document(text);
            let chunks = chunk_document(&doc, max);
            assert!(!chunks.is_empty());

            let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
            assert_eq!(&rebuilt, text, "max={max}");

            let mut expected_start = 0;
            for (position, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.position, position);
                assert_eq!(chunk.start, expected_start);
                assert_eq!(&text[chunk.start..chunk.end], chunk.text);
                // only a merged whitespace tail may run past the bound
                assert!(
                    chunk.text.trim_end().len() <= max,
                    "chunk {position} is {} bytes against a {max}-byte bound",
                    chunk.len()
                );
                expected_start = chunk.end;
            }
        }
    }
}

#[test]
fn sentences_become_separate_chunks() {
    let doc = document("Acme Corp acquired Beta Inc in 2020. In 2023, Acme Corp sold Beta Inc.");
    let chunks = chunk_document(&doc, 1_000);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].text, "Acme Corp acquired Beta Inc in 2020. ");
    assert_eq!(chunks[1].text, "In 2023, Acme Corp sold Beta Inc.");
    assert!(chunks.iter().all(|c| c.reference_time == doc.metadata.timestamp));
}

#[test]
fn rechunking_gives_identical_ids() {
    let doc = document(SAMPLES[0]);
    let a: Vec<_> = chunk_document(&doc, 24).into_iter().map(|c| c.id).collect();
    let b: Vec<_> = chunk_document(&doc, 24).into_iter().map(|c| c.id).collect();
    assert_eq!(a, b);
}
