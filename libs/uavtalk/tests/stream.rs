use std::sync::Arc;

use proptest::prelude::*;
use uavo::{ObjectInstance, SchemaRegistry, Value};
use uavtalk::{Decoder, DecoderConfig, SYNC, log_record, send_object};

const BARO: &str = r#"<xml>
  <object name="BaroAltitude" singleinstance="true" settings="false">
    <description>Barometric altitude.</description>
    <field name="Altitude" units="m" type="float" elements="1"/>
    <field name="Temperature" units="C" type="float" elements="1"/>
    <field name="Pressure" units="kPa" type="float" elements="1"/>
  </object>
</xml>"#;

const CHANNELS: &str = r#"<xml>
  <object name="ReceiverChannels" singleinstance="false" settings="false">
    <description>Raw receiver pulses.</description>
    <field name="Channel" units="us" type="uint16" elements="8"/>
    <field name="Quality" units="%" type="uint8" elements="1"/>
  </object>
</xml>"#;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_xml([BARO, CHANNELS]).unwrap())
}

fn objects(registry: &SchemaRegistry, seeds: &[(bool, u16)]) -> Vec<ObjectInstance> {
    seeds
        .iter()
        .map(|&(baro, seed)| {
            if baro {
                let def = registry.find_by_name("BaroAltitude").unwrap();
                let mut obj = ObjectInstance::new(def);
                obj.set("Altitude", Value::F32(seed as f32 / 4.0)).unwrap();
                obj
            } else {
                let def = registry.find_by_name("ReceiverChannels").unwrap();
                let mut obj = ObjectInstance::new(def).with_instance_id(seed % 4);
                obj.set_element("Channel", (seed % 8) as usize, Value::U16(1000 + seed))
                    .unwrap();
                obj
            }
        })
        .collect()
}

fn feed_in_chunks(decoder: &mut Decoder, stream: &[u8], cuts: &[usize]) -> Vec<ObjectInstance> {
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
    cuts.sort_unstable();
    let mut out = Vec::new();
    let mut start = 0;
    for cut in cuts.into_iter().chain([stream.len()]) {
        out.extend(decoder.feed(&stream[start..cut], &mut ()));
        start = cut;
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn chunking_and_noise_do_not_change_the_objects(
        seeds in prop::collection::vec((any::<bool>(), any::<u16>()), 1..12),
        noise in prop::collection::vec(prop::collection::vec(any::<u8>().prop_filter("no sync", |b| *b != SYNC), 0..6), 12),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
    ) {
        let registry = registry();
        let objects = objects(&registry, &seeds);
        let mut stream = Vec::new();
        for (obj, noise) in objects.iter().zip(noise.iter().cycle()) {
            stream.extend_from_slice(noise);
            stream.extend(send_object(obj, false).unwrap());
        }

        let mut decoder = Decoder::new(registry, DecoderConfig::default());
        let out = feed_in_chunks(&mut decoder, &stream, &cuts);
        prop_assert_eq!(out, objects);
        prop_assert_eq!(decoder.stats().crc_errors, 0);
    }

    #[test]
    fn log_records_split_anywhere(
        seeds in prop::collection::vec((any::<bool>(), any::<u16>()), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
    ) {
        let registry = registry();
        let objects = objects(&registry, &seeds);
        let mut stream = Vec::new();
        for (i, obj) in objects.iter().enumerate() {
            stream.extend(log_record(1000 + i as u32, &send_object(obj, false).unwrap()));
        }

        let config = DecoderConfig::default().with_gcs_timestamps(true);
        let mut decoder = Decoder::new(registry, config);
        let out = feed_in_chunks(&mut decoder, &stream, &cuts);
        let stamps: Vec<u64> = out.iter().map(|o| o.timestamp()).collect();
        let expected: Vec<u64> = (0..objects.len() as u64).map(|i| 1000 + i).collect();
        prop_assert_eq!(stamps, expected);
    }
}
