//! Fragmented MP4 synthesis
//!
//! Builds a CMAF-compatible init segment (ftyp + moov + mvex) from SPS/PPS
//! and one moof+mdat pair per sample, suitable for Media Source Extensions.
//! Timescale is fixed at 90000, track id is 1.

const TIMESCALE: u32 = 90_000;
const TRACK_ID: u32 = 1;

/// trun sample flags: sync sample (keyframe).
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// trun sample flags: non-sync sample depending on others.
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// Fragment duration for one frame at the given rate, in timescale units.
/// Falls back to 6000 (15 fps) when the rate is unknown.
pub fn sample_duration_for_fps(fps: u32) -> u32 {
    if fps > 0 {
        TIMESCALE / fps
    } else {
        6000
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_tag(buf: &mut Vec<u8>, tag: &[u8; 4]) {
    buf.extend_from_slice(tag);
}

fn push_box(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    push_u32(out, (payload.len() + 8) as u32);
    push_tag(out, tag);
    out.extend_from_slice(payload);
}

fn push_version_flags(buf: &mut Vec<u8>, version: u8, flags: u32) {
    buf.push(version);
    buf.push(((flags >> 16) & 0xFF) as u8);
    buf.push(((flags >> 8) & 0xFF) as u8);
    buf.push((flags & 0xFF) as u8);
}

const MATRIX_IDENTITY: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Fragmented MP4 builder for one H.264 video track. Immutable after
/// construction; fragment sequence numbers and decode times are supplied by
/// the caller and must be monotonically non-decreasing.
pub struct Mp4Fragmenter {
    width: u32,
    height: u32,
    fps: u32,
    sps: Vec<u8>,
    pps: Vec<u8>,
}

impl Mp4Fragmenter {
    pub fn new(width: u32, height: u32, fps: u32, sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self {
            width,
            height,
            fps,
            sps,
            pps,
        }
    }

    /// Per-sample duration in timescale units for this track's rate.
    pub fn sample_duration(&self) -> u32 {
        sample_duration_for_fps(self.fps)
    }

    /// Build the single init segment: `ftyp + moov(mvhd + trak + mvex)`.
    pub fn build_init_segment(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);

        // ftyp
        {
            let mut p = Vec::new();
            push_tag(&mut p, b"isom");
            push_u32(&mut p, 0x0000_0200);
            push_tag(&mut p, b"isom");
            push_tag(&mut p, b"iso6");
            push_tag(&mut p, b"avc1");
            push_box(&mut out, b"ftyp", &p);
        }

        let mut moov = Vec::new();

        // mvhd
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0); // creation time
            push_u32(&mut p, 0); // modification time
            push_u32(&mut p, TIMESCALE);
            push_u32(&mut p, TIMESCALE * 60); // duration placeholder
            push_u32(&mut p, 0x0001_0000); // rate 1.0
            push_u16(&mut p, 0x0100); // volume 1.0
            p.extend_from_slice(&[0u8; 10]); // reserved
            for m in MATRIX_IDENTITY {
                push_u32(&mut p, m);
            }
            p.extend_from_slice(&[0u8; 24]); // pre_defined
            push_u32(&mut p, 2); // next_track_ID
            push_box(&mut moov, b"mvhd", &p);
        }

        let mut trak = Vec::new();

        // tkhd
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0x000007); // enabled, in movie, in preview
            push_u32(&mut p, 0); // creation time
            push_u32(&mut p, 0); // modification time
            push_u32(&mut p, TRACK_ID);
            push_u32(&mut p, 0); // reserved
            push_u32(&mut p, TIMESCALE * 60); // duration placeholder
            push_u64(&mut p, 0); // reserved
            push_u16(&mut p, 0); // layer
            push_u16(&mut p, 0); // alternate group
            push_u16(&mut p, 0); // volume (0 for video)
            push_u16(&mut p, 0);
            for m in MATRIX_IDENTITY {
                push_u32(&mut p, m);
            }
            push_u32(&mut p, self.width << 16); // 16.16 fixed point
            push_u32(&mut p, self.height << 16);
            push_box(&mut trak, b"tkhd", &p);
        }

        let mut mdia = Vec::new();

        // mdhd
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0);
            push_u32(&mut p, 0);
            push_u32(&mut p, TIMESCALE);
            push_u32(&mut p, TIMESCALE * 60); // duration placeholder
            push_u16(&mut p, 0x55c4); // language "und"
            push_u16(&mut p, 0);
            push_box(&mut mdia, b"mdhd", &p);
        }

        // hdlr
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0); // pre_defined
            push_tag(&mut p, b"vide");
            p.extend_from_slice(&[0u8; 12]); // reserved
            p.extend_from_slice(b"video\0");
            push_box(&mut mdia, b"hdlr", &p);
        }

        let mut minf = Vec::new();

        // vmhd
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0x000001);
            push_u16(&mut p, 0); // graphics mode
            push_u16(&mut p, 0); // opcolor
            push_u16(&mut p, 0);
            push_u16(&mut p, 0);
            push_box(&mut minf, b"vmhd", &p);
        }

        // dinf(dref(url))
        {
            let mut url = Vec::new();
            push_version_flags(&mut url, 0, 0x000001); // self-contained
            let mut url_box = Vec::new();
            push_box(&mut url_box, b"url ", &url);

            let mut dref = Vec::new();
            push_version_flags(&mut dref, 0, 0);
            push_u32(&mut dref, 1);
            dref.extend_from_slice(&url_box);

            let mut dinf = Vec::new();
            push_box(&mut dinf, b"dref", &dref);
            push_box(&mut minf, b"dinf", &dinf);
        }

        let mut stbl = Vec::new();

        // stsd(avc1(avcC))
        {
            let mut avc1 = Vec::new();
            avc1.extend_from_slice(&[0u8; 6]); // reserved
            push_u16(&mut avc1, 1); // data reference index
            avc1.extend_from_slice(&[0u8; 16]); // pre_defined + reserved
            push_u16(&mut avc1, self.width as u16);
            push_u16(&mut avc1, self.height as u16);
            push_u32(&mut avc1, 0x0048_0000); // horizontal resolution 72 dpi
            push_u32(&mut avc1, 0x0048_0000); // vertical resolution
            push_u32(&mut avc1, 0); // reserved
            push_u16(&mut avc1, 1); // frame count
            avc1.extend_from_slice(&[0u8; 32]); // compressor name
            push_u16(&mut avc1, 0x0018); // depth
            push_u16(&mut avc1, 0xffff); // pre_defined

            let mut avcc = Vec::new();
            avcc.push(1); // configurationVersion
            avcc.push(if self.sps.len() >= 4 { self.sps[1] } else { 0 }); // AVCProfileIndication
            avcc.push(if self.sps.len() >= 4 { self.sps[2] } else { 0 }); // profile_compatibility
            avcc.push(if self.sps.len() >= 4 { self.sps[3] } else { 0 }); // AVCLevelIndication
            avcc.push(0xFF); // lengthSizeMinusOne = 3 (4-byte lengths)
            avcc.push(0xE1); // one sequence parameter set
            push_u16(&mut avcc, self.sps.len() as u16);
            avcc.extend_from_slice(&self.sps);
            avcc.push(1); // one picture parameter set
            push_u16(&mut avcc, self.pps.len() as u16);
            avcc.extend_from_slice(&self.pps);

            let mut avc1_box = Vec::new();
            push_box(&mut avc1_box, b"avcC", &avcc);
            avc1.extend_from_slice(&avc1_box);

            let mut sample_entry = Vec::new();
            push_box(&mut sample_entry, b"avc1", &avc1);

            let mut stsd = Vec::new();
            push_version_flags(&mut stsd, 0, 0);
            push_u32(&mut stsd, 1);
            stsd.extend_from_slice(&sample_entry);
            push_box(&mut stbl, b"stsd", &stsd);
        }

        // Empty un-fragmented sample tables.
        for tag in [b"stts", b"stsc"] {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0);
            push_box(&mut stbl, tag, &p);
        }
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0); // sample size
            push_u32(&mut p, 0); // sample count
            push_box(&mut stbl, b"stsz", &p);
        }
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, 0);
            push_box(&mut stbl, b"stco", &p);
        }

        push_box(&mut minf, b"stbl", &stbl);
        push_box(&mut mdia, b"minf", &minf);
        push_box(&mut trak, b"mdia", &mdia);
        push_box(&mut moov, b"trak", &trak);

        // mvex(trex)
        {
            let mut trex = Vec::new();
            push_version_flags(&mut trex, 0, 0);
            push_u32(&mut trex, TRACK_ID);
            push_u32(&mut trex, 1); // default sample description (1-based)
            push_u32(&mut trex, 0); // default duration
            push_u32(&mut trex, 0); // default size
            push_u32(&mut trex, 0x0100_0000); // default flags: non-sync
            let mut mvex = Vec::new();
            push_box(&mut mvex, b"trex", &trex);
            push_box(&mut moov, b"mvex", &mvex);
        }

        push_box(&mut out, b"moov", &moov);
        out
    }

    /// Build one `moof + mdat` pair for a single AVCC sample.
    pub fn build_fragment(
        &self,
        avcc_sample: &[u8],
        sequence_number: u32,
        base_decode_time: u64,
        sample_duration: u32,
        keyframe: bool,
    ) -> Vec<u8> {
        let mut mfhd = Vec::new();
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, sequence_number);
            push_box(&mut mfhd, b"mfhd", &p);
        }

        let mut tfhd = Vec::new();
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0x020000); // default-base-is-moof
            push_u32(&mut p, TRACK_ID);
            push_box(&mut tfhd, b"tfhd", &p);
        }

        let mut tfdt = Vec::new();
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0);
            push_u32(&mut p, base_decode_time as u32);
            push_box(&mut tfdt, b"tfdt", &p);
        }

        // trun data-offset covers the enclosing moof plus the mdat header, so
        // the sizes are fixed before the trun itself is serialized.
        let trun_payload = 4 + 4 + 4 + 4 + 4 + 4; // version/flags, count, offset, duration, size, flags
        let trun_size = trun_payload + 8;
        let traf_size = (tfhd.len() + tfdt.len() + trun_size + 8) as u32;
        let moof_size = (mfhd.len() + 8) as u32 + traf_size;
        let data_offset = moof_size + 8; // plus the mdat header

        let mut trun = Vec::new();
        {
            let mut p = Vec::new();
            push_version_flags(&mut p, 0, 0x000701); // data-offset + first-sample-flags... duration/size/flags per sample
            push_u32(&mut p, 1); // sample count
            push_u32(&mut p, data_offset);
            push_u32(&mut p, sample_duration);
            push_u32(&mut p, avcc_sample.len() as u32);
            push_u32(
                &mut p,
                if keyframe {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                },
            );
            push_box(&mut trun, b"trun", &p);
        }

        let mut traf = Vec::new();
        {
            let mut p = Vec::new();
            p.extend_from_slice(&tfhd);
            p.extend_from_slice(&tfdt);
            p.extend_from_slice(&trun);
            push_box(&mut traf, b"traf", &p);
        }

        let mut out = Vec::with_capacity(data_offset as usize + avcc_sample.len());
        {
            let mut p = Vec::new();
            p.extend_from_slice(&mfhd);
            p.extend_from_slice(&traf);
            push_box(&mut out, b"moof", &p);
        }
        push_u32(&mut out, (8 + avcc_sample.len()) as u32);
        push_tag(&mut out, b"mdat");
        out.extend_from_slice(avcc_sample);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fragmenter() -> Mp4Fragmenter {
        Mp4Fragmenter::new(
            1280,
            720,
            30,
            vec![0x67, 0x42, 0xC0, 0x1E, 0xAB],
            vec![0x68, 0xCE, 0x3C, 0x80],
        )
    }

    /// Walk top-level boxes of a buffer, returning (tag, payload offset, payload len).
    fn walk_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
        let mut boxes = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let tag = String::from_utf8_lossy(&data[pos + 4..pos + 8]).into_owned();
            assert!(size >= 8, "box {} has undersized length", tag);
            assert!(pos + size <= data.len(), "box {} overruns buffer", tag);
            boxes.push((tag, pos + 8, size - 8));
            pos += size;
        }
        assert_eq!(pos, data.len(), "trailing bytes after last box");
        boxes
    }

    fn find_box<'a>(data: &'a [u8], tag: &str) -> Option<&'a [u8]> {
        for (t, off, len) in walk_boxes(data) {
            if t == tag {
                return Some(&data[off..off + len]);
            }
        }
        None
    }

    #[test]
    fn test_init_segment_structure() {
        let init = test_fragmenter().build_init_segment();
        let boxes = walk_boxes(&init);
        let tags: Vec<_> = boxes.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(tags, vec!["ftyp", "moov"]);

        let ftyp = find_box(&init, "ftyp").unwrap();
        assert_eq!(&ftyp[0..4], b"isom"); // major brand
        assert_eq!(&ftyp[8..12], b"isom");
        assert_eq!(&ftyp[12..16], b"iso6");
        assert_eq!(&ftyp[16..20], b"avc1");

        let moov = find_box(&init, "moov").unwrap();
        let moov_tags: Vec<_> = walk_boxes(moov)
            .iter()
            .map(|(t, _, _)| t.clone())
            .collect();
        assert_eq!(moov_tags, vec!["mvhd", "trak", "mvex"]);
    }

    #[test]
    fn test_init_segment_timescale_and_track() {
        let init = test_fragmenter().build_init_segment();
        let moov = find_box(&init, "moov").unwrap();

        let mvhd = find_box(moov, "mvhd").unwrap();
        let timescale = u32::from_be_bytes(mvhd[12..16].try_into().unwrap());
        assert_eq!(timescale, 90_000);

        let trak = find_box(moov, "trak").unwrap();
        let tkhd = find_box(trak, "tkhd").unwrap();
        let track_id = u32::from_be_bytes(tkhd[12..16].try_into().unwrap());
        assert_eq!(track_id, 1);
        // Width/height as 16.16 fixed point at the end of tkhd.
        let w = u32::from_be_bytes(tkhd[tkhd.len() - 8..tkhd.len() - 4].try_into().unwrap());
        let h = u32::from_be_bytes(tkhd[tkhd.len() - 4..].try_into().unwrap());
        assert_eq!(w >> 16, 1280);
        assert_eq!(h >> 16, 720);
    }

    #[test]
    fn test_init_segment_carries_parameter_sets() {
        let frag = test_fragmenter();
        let init = frag.build_init_segment();
        // The avcC payload embeds SPS then PPS with 16-bit lengths.
        let sps_pos = init
            .windows(frag.sps.len())
            .position(|w| w == frag.sps.as_slice());
        let pps_pos = init
            .windows(frag.pps.len())
            .position(|w| w == frag.pps.as_slice());
        assert!(sps_pos.is_some());
        assert!(pps_pos.is_some());
        assert!(sps_pos.unwrap() < pps_pos.unwrap());
    }

    #[test]
    fn test_trex_defaults() {
        let init = test_fragmenter().build_init_segment();
        let moov = find_box(&init, "moov").unwrap();
        let mvex = find_box(moov, "mvex").unwrap();
        let trex = find_box(mvex, "trex").unwrap();
        assert_eq!(u32::from_be_bytes(trex[4..8].try_into().unwrap()), 1); // track
        assert_eq!(u32::from_be_bytes(trex[8..12].try_into().unwrap()), 1); // sample description
        assert_eq!(
            u32::from_be_bytes(trex[20..24].try_into().unwrap()),
            0x0100_0000
        ); // default non-sync flags
    }

    #[test]
    fn test_fragment_layout_and_data_offset() {
        let frag = test_fragmenter();
        let sample = vec![0u8; 100];
        let out = frag.build_fragment(&sample, 1, 0, 3000, true);

        let boxes = walk_boxes(&out);
        let tags: Vec<_> = boxes.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(tags, vec!["moof", "mdat"]);

        let (_, moof_off, moof_len) = boxes[0].clone();
        let moof_total = moof_len + 8;
        let moof = &out[moof_off..moof_off + moof_len];

        let traf = find_box(moof, "traf").unwrap();
        let trun = find_box(traf, "trun").unwrap();
        let data_offset = u32::from_be_bytes(trun[8..12].try_into().unwrap()) as usize;

        // data_offset points from the start of moof to the first mdat payload
        // byte.
        assert_eq!(data_offset, moof_total + 8);
        assert_eq!(&out[data_offset..data_offset + sample.len()], &sample[..]);

        let duration = u32::from_be_bytes(trun[12..16].try_into().unwrap());
        let size = u32::from_be_bytes(trun[16..20].try_into().unwrap());
        assert_eq!(duration, 3000);
        assert_eq!(size, 100);
    }

    #[test]
    fn test_fragment_sequence_and_decode_time() {
        let frag = test_fragmenter();
        let out = frag.build_fragment(&[1, 2, 3], 7, 9000, 3000, false);
        let moof = find_box(&out, "moof").unwrap();

        let mfhd = find_box(moof, "mfhd").unwrap();
        assert_eq!(u32::from_be_bytes(mfhd[4..8].try_into().unwrap()), 7);

        let traf = find_box(moof, "traf").unwrap();
        let tfdt = find_box(traf, "tfdt").unwrap();
        assert_eq!(u32::from_be_bytes(tfdt[4..8].try_into().unwrap()), 9000);
    }

    #[test]
    fn test_fragment_keyframe_flags() {
        let frag = test_fragmenter();
        for (keyframe, expected) in [(true, 0x0200_0000u32), (false, 0x0101_0000u32)] {
            let out = frag.build_fragment(&[0u8; 8], 1, 0, 3000, keyframe);
            let moof = find_box(&out, "moof").unwrap();
            let traf = find_box(moof, "traf").unwrap();
            let trun = find_box(traf, "trun").unwrap();
            let flags = u32::from_be_bytes(trun[20..24].try_into().unwrap());
            assert_eq!(flags, expected);
        }
    }

    #[test]
    fn test_sample_duration() {
        assert_eq!(sample_duration_for_fps(30), 3000);
        assert_eq!(sample_duration_for_fps(0), 6000);
        assert_eq!(test_fragmenter().sample_duration(), 3000);
    }
}
