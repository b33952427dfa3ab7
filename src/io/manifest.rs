use crate::types::{PassDirection, SarError, SarResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

/// Acquisition geometry recorded in a SAFE `manifest.safe`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestInfo {
    pub pass: Option<PassDirection>,
    pub absolute_orbit: Option<u32>,
    pub relative_orbit: Option<u16>,
}

/// Reader for the manifest of raw Sentinel-1 archives
pub struct ManifestReader;

impl ManifestReader {
    /// Read `manifest.safe` from a zipped SAFE product
    pub fn read_archive<P: AsRef<Path>>(zip_path: P) -> SarResult<ManifestInfo> {
        let zip_path = zip_path.as_ref();
        log::debug!("Reading manifest from {}", zip_path.display());

        let file = File::open(zip_path)?;
        let mut archive = ZipArchive::new(file)?;

        let manifest_name = archive
            .file_names()
            .find(|name| name.ends_with("manifest.safe"))
            .map(|name| name.to_string())
            .ok_or_else(|| {
                SarError::InvalidFormat(format!(
                    "No manifest.safe in archive {}",
                    zip_path.display()
                ))
            })?;

        let mut content = String::new();
        archive.by_name(&manifest_name)?.read_to_string(&mut content)?;

        Self::parse_manifest(&content)
    }

    /// Extract pass direction and orbit numbers; the first occurrence of each element wins
    pub fn parse_manifest(xml_content: &str) -> SarResult<ManifestInfo> {
        let mut reader = Reader::from_str(xml_content);
        reader.trim_text(true);

        let mut info = ManifestInfo::default();
        let mut current = String::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(element)) => {
                    current = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                }
                Ok(Event::Text(text)) => {
                    let value = text
                        .unescape()
                        .map_err(|e| SarError::XmlParsing(e.to_string()))?;
                    match current.as_str() {
                        "pass" if info.pass.is_none() => {
                            info.pass = value.parse::<PassDirection>().ok();
                        }
                        "orbitNumber" if info.absolute_orbit.is_none() => {
                            info.absolute_orbit = value.trim().parse().ok();
                        }
                        "relativeOrbitNumber" if info.relative_orbit.is_none() => {
                            info.relative_orbit = value.trim().parse().ok();
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(_)) => current.clear(),
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(SarError::XmlParsing(format!(
                        "manifest error at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
            buf.clear();
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xfdu:XFDU xmlns:xfdu="urn:ccsds:schema:xfdu:1" xmlns:safe="http://www.esa.int/safe/sentinel-1.0" xmlns:s1="http://www.esa.int/safe/sentinel-1.0/sentinel-1">
  <metadataSection>
    <metadataObject ID="measurementOrbitReference">
      <metadataWrap>
        <xmlData>
          <safe:orbitReference>
            <safe:orbitNumber type="start">52101</safe:orbitNumber>
            <safe:orbitNumber type="stop">52101</safe:orbitNumber>
            <safe:relativeOrbitNumber type="start">126</safe:relativeOrbitNumber>
            <safe:extension>
              <s1:orbitProperties>
                <s1:pass>DESCENDING</s1:pass>
              </s1:orbitProperties>
            </safe:extension>
          </safe:orbitReference>
        </xmlData>
      </metadataWrap>
    </metadataObject>
  </metadataSection>
</xfdu:XFDU>"#;

    #[test]
    fn test_parse_manifest_fields() {
        let info = ManifestReader::parse_manifest(MANIFEST).unwrap();
        assert_eq!(info.pass, Some(PassDirection::Descending));
        assert_eq!(info.absolute_orbit, Some(52101));
        assert_eq!(info.relative_orbit, Some(126));
    }

    #[test]
    fn test_manifest_without_orbit_section() {
        let info = ManifestReader::parse_manifest("<root><other>1</other></root>").unwrap();
        assert_eq!(info, ManifestInfo::default());
    }

    #[test]
    fn test_read_manifest_from_zip() {
        let dir = tempfile::TempDir::new().unwrap();
        let zip_path = dir.path().join(
            "S1A_IW_GRDH_1SDV_20240103T224512_20240103T224537_052101_064BB2_1A2B.zip",
        );
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(
                "S1A_IW_GRDH_1SDV_20240103T224512_20240103T224537_052101_064BB2_1A2B.SAFE/manifest.safe",
                zip::write::FileOptions::default(),
            )
            .unwrap();
        writer.write_all(MANIFEST.as_bytes()).unwrap();
        writer.finish().unwrap();

        let info = ManifestReader::read_archive(&zip_path).unwrap();
        assert_eq!(info.pass, Some(PassDirection::Descending));
    }

    #[test]
    fn test_archive_without_manifest_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let zip_path = dir.path().join("empty.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("readme.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            ManifestReader::read_archive(&zip_path),
            Err(SarError::InvalidFormat(_))
        ));
    }
}
