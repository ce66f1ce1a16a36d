//! Charts to measure and sinks that take the results.
//!
//! Parsing chart files is left to the caller; a [`Chart`] is just the ordered
//! list of patches, each with an optional expected value.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{
    color::{Lab, Xyz},
    orchestrator::MeasurementResult,
    spectral::same_grid,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    #[serde(default)]
    pub expected_xyz: Option<Xyz>,
    #[serde(default)]
    pub expected_lab: Option<Lab>,
}

impl Patch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expected_xyz: None,
            expected_lab: None,
        }
    }

    pub fn with_expected_lab(mut self, lab: Lab) -> Self {
        self.expected_lab = Some(lab);
        self
    }

    pub fn with_expected_xyz(mut self, xyz: Xyz) -> Self {
        self.expected_xyz = Some(xyz);
        self
    }

    /// CIE76 distance from the expected LAB, when there is one.
    pub fn delta_e(&self, result: &MeasurementResult) -> Option<f64> {
        self.expected_lab.map(|lab| lab.delta_e(&result.lab))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    patches: Vec<Patch>,
}

impl Chart {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self { patches }
    }

    /// Chart from patch ids with no expected values.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(Patch::new).collect())
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn push(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Receives `(patch id, result)` pairs in measurement order.
pub trait MeasurementSink {
    fn write(&mut self, patch_id: &str, result: &MeasurementResult) -> crate::Result<()>;

    /// Called once after the last patch.
    fn finish(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

impl MeasurementSink for Vec<(String, MeasurementResult)> {
    fn write(&mut self, patch_id: &str, result: &MeasurementResult) -> crate::Result<()> {
        self.push((patch_id.to_string(), result.clone()));
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonEntry {
    patch: String,
    #[serde(flatten)]
    result: MeasurementResult,
}

/// Writes every result as one pretty-printed JSON array on `finish`.
pub struct JsonSink<W: Write> {
    writer: W,
    entries: Vec<JsonEntry>,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            entries: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MeasurementSink for JsonSink<W> {
    fn write(&mut self, patch_id: &str, result: &MeasurementResult) -> crate::Result<()> {
        self.entries.push(JsonEntry {
            patch: patch_id.to_string(),
            result: result.clone(),
        });
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, &self.entries)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

const CSV_COLUMNS: [&str; 10] = ["patch", "X", "Y", "Z", "L", "a", "b", "R", "G", "B"];

/// One row per patch: colour values followed by the spectrum, one column
/// per wavelength.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    wavelengths: Option<Vec<f64>>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            wavelengths: None,
        }
    }

    pub fn into_inner(self) -> crate::Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

impl<W: Write> MeasurementSink for CsvSink<W> {
    fn write(&mut self, patch_id: &str, result: &MeasurementResult) -> crate::Result<()> {
        if let Some(wavelengths) = &self.wavelengths {
            if !same_grid(wavelengths, &result.wavelengths) {
                return Err(crate::Error::Serialization(format!(
                    "patch {patch_id} uses a different wavelength grid"
                )));
            }
        } else {
            let mut header: Vec<String> = CSV_COLUMNS.iter().map(|c| c.to_string()).collect();
            header.extend(result.wavelengths.iter().map(|w| format!("{w:.0}nm")));
            self.writer.write_record(&header)?;
            self.wavelengths = Some(result.wavelengths.clone());
        }

        let mut record = vec![patch_id.to_string()];
        record.extend(
            [result.xyz.x, result.xyz.y, result.xyz.z, result.lab.l, result.lab.a, result.lab.b]
                .iter()
                .map(|v| format!("{v:.4}")),
        );
        record.extend(result.rgb.to_array().iter().map(|v| format!("{v:.0}")));
        record.extend(result.spd.iter().map(|v| format!("{v:.4}")));
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        color::{ColorSpace, Rgb, WhitePoint},
        spectral::Viewing,
    };

    fn result(l: f64) -> MeasurementResult {
        MeasurementResult {
            identifier: uuid::Uuid::new_v4(),
            viewing: Viewing::default(),
            whitepoint: WhitePoint::D65_10,
            space: ColorSpace::Lab,
            xyz: Xyz::new(20.0, 21.0, 22.0),
            lab: Lab::new(l, 1.0, -1.0),
            rgb: Rgb::new(120.0, 121.0, 122.0),
            spd: vec![10.0, 20.0, 30.0],
            wavelengths: vec![400.0, 410.0, 420.0],
            device_xyz: None,
            samples: 1,
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_chart_from_ids() {
        let chart = Chart::from_ids(["A1", "A2", "A3"]);
        assert_eq!(chart.len(), 3);
        assert_eq!(chart.patches()[1].id, "A2");
        assert!(Chart::default().is_empty());
    }

    #[test]
    fn test_patch_delta_e() {
        let patch = Patch::new("A1").with_expected_lab(Lab::new(50.0, 1.0, -1.0));
        assert_eq!(patch.delta_e(&result(53.0)), Some(3.0));
        assert_eq!(Patch::new("A2").delta_e(&result(53.0)), None);
    }

    #[test]
    fn test_json_sink() {
        let mut sink = JsonSink::new(Vec::new());
        sink.write("A1", &result(50.0)).unwrap();
        sink.write("A2", &result(60.0)).unwrap();
        sink.finish().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&sink.into_inner()).unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["patch"], "A2");
        assert_eq!(entries[1]["lab"]["l"], 60.0);
    }

    #[test]
    fn test_csv_sink() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write("A1", &result(50.0)).unwrap();
        sink.finish().unwrap();
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("patch,X,Y,Z,L,a,b,R,G,B,400nm,410nm,420nm")
        );
        assert_eq!(
            lines.next(),
            Some("A1,20.0000,21.0000,22.0000,50.0000,1.0000,-1.0000,120,121,122,10.0000,20.0000,30.0000")
        );
    }

    #[test]
    fn test_csv_sink_rejects_grid_change() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write("A1", &result(50.0)).unwrap();
        let mut other = result(50.0);
        other.wavelengths = vec![400.0, 420.0, 440.0];
        assert!(sink.write("A2", &other).is_err());
    }
}
