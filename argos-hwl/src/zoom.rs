use argos_core::metadata::tags;
use argos_core::Metadata;

/// Mapper de ratio de zoom.
///
/// Le framework exprime le zoom par un ratio; les pipelines attendent une
/// région de recadrage absolue dans la matrice active. Le mapper réécrit la
/// région à l'aller et restitue le ratio au retour.
#[derive(Debug, Clone)]
pub struct ZoomRatioMapper {
    /// Largeur de la matrice active (pré-correction)
    active_array_width: u32,

    /// Hauteur de la matrice active (pré-correction)
    active_array_height: u32,
}

impl ZoomRatioMapper {
    pub fn new(active_array_width: u32, active_array_height: u32) -> Self {
        Self {
            active_array_width,
            active_array_height,
        }
    }

    /// Réécrit la région de recadrage d'une requête selon le ratio de zoom.
    /// Sans ratio, la requête est laissée telle quelle.
    pub fn update_capture_request(&self, metadata: &mut Metadata) {
        let ratio = match metadata.get_f32(tags::CONTROL_ZOOM_RATIO) {
            Some(ratio) if ratio > 0.0 => ratio,
            _ => return,
        };

        let width = (self.active_array_width as f32 / ratio) as i32;
        let height = (self.active_array_height as f32 / ratio) as i32;
        let left = (self.active_array_width as i32 - width) / 2;
        let top = (self.active_array_height as i32 - height) / 2;

        metadata.set_i32(tags::SCALER_CROP_REGION, &[left, top, width, height]);
    }

    /// Restitue le ratio de zoom dans un résultat à partir de la région de
    /// recadrage renvoyée par le pipeline
    pub fn update_capture_result(&self, metadata: &mut Metadata) {
        let crop = match metadata.get_i32_slice(tags::SCALER_CROP_REGION) {
            Some(crop) if crop.len() == 4 && crop[2] > 0 => crop.to_vec(),
            _ => return,
        };

        let ratio = self.active_array_width as f32 / crop[2] as f32;
        metadata.set_f32(tags::CONTROL_ZOOM_RATIO, &[ratio]);
    }
}
