use super::onnx::TensorProto;
use super::tensor::{DType, Shape, Tensor, TensorData};
use super::{Error, onnx};
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::{Metadata, TensorInfo};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Receives parameter data while a model proto is being assembled.
pub trait WeightExternalOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error>;
    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct EmbeddedOutputManager<'a> {
    tensor_data_map: HashMap<&'a dyn Tensor, TensorData>,
}

impl EmbeddedOutputManager<'_> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> WeightExternalOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_data: TensorData) -> Result<(), Error> {
        self.tensor_data_map.insert(graph_tensor, tensor_data);
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        match self.tensor_data_map.remove(&graph_tensor) {
            Some(tensor_data) => Ok(Some(tensor_data.to_tensor_data_proto(Some(tensor_name))?)),
            None => Ok(None),
        }
    }
}

/// Writes parameters into a sidecar file and references them as ONNX external data.
pub struct BinOutputManager<'a> {
    output: File,
    output_path: PathBuf,
    written: usize,
    tensor_data_map: HashMap<&'a dyn Tensor, (TensorData, usize, usize)>,
    location: Option<String>,
}

impl BinOutputManager<'_> {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let output = File::create(output_location)?;
        Ok(Self {
            output,
            output_path: output_location.to_path_buf(),
            written: 0,
            tensor_data_map: HashMap::new(),
            location: None,
        })
    }
}

impl<'a> WeightExternalOutputManager<'a> for BinOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error> {
        let bytes = data.to_raw_encoding();
        self.output.write_all(&bytes)?;
        let offset = self.written;
        self.written += bytes.len();
        self.tensor_data_map.insert(graph_tensor, (data, offset, bytes.len()));
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        let Some((data, byte_offset, byte_len)) = self.tensor_data_map.remove(&graph_tensor) else {
            return Ok(None);
        };
        let location = self.location.clone().ok_or_else(|| Error::InvalidInputError("external data requested before finalize".to_string()))?;
        let external_data = vec![
            onnx::StringStringEntryProto { key: "location".to_string(), value: location },
            onnx::StringStringEntryProto { key: "offset".to_string(), value: format!("{byte_offset}") },
            onnx::StringStringEntryProto { key: "length".to_string(), value: format!("{byte_len}") },
        ];
        Ok(Some(TensorProto {
            name: tensor_name,
            data_type: onnx::tensor_proto::DataType::from(data.dtype()) as i32,
            dims: data.shape().resolve()?.iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data,
            ..Default::default()
        }))
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        let file_name = self
            .output_path
            .file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidInputError(format!("{} has no file name", self.output_path.display())))?;
        self.location = Some(file_name.to_string());
        Ok(())
    }
}

/// Scoped access to a checkpoint's named parameters.
pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn has_tensor(&self, name: &str) -> bool;
    fn get_prefix(&self) -> Option<&str>;
    fn get_tensor_names(&self) -> Vec<String>;
}

fn scoped_name(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}

pub struct PthTensor {
    tensor_info: candle_core::pickle::TensorInfo,
    tensors: Arc<candle_core::pickle::PthTensors>,
    shape: Shape,
}

impl PthTensor {
    pub fn new(tensor_info: candle_core::pickle::TensorInfo, tensors: Arc<candle_core::pickle::PthTensors>) -> Result<Arc<Self>, Error> {
        match tensor_info.dtype {
            candle_core::DType::F32 | candle_core::DType::F16 | candle_core::DType::BF16 => {}
            dtype => return Err(Error::UnsupportedDTypeError(format!("{dtype:?}"))),
        }
        let shape = Shape::from(tensor_info.layout.shape().dims());
        Ok(Arc::new(Self { tensor_info, tensors, shape }))
    }
}

impl Tensor for PthTensor {
    /// Half precision checkpoints are widened on load.
    fn dtype(&self) -> DType {
        DType::F32
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.tensor_info.name)
    }

    fn is_input(&self) -> bool {
        false
    }

    fn is_weight(&self) -> bool {
        true
    }

    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        let tensor = self
            .tensors
            .get(&self.tensor_info.name)?
            .ok_or_else(|| Error::NoSuchTensorError(self.tensor_info.name.clone()))?;
        Ok(Some(TensorData::from_candle_tensor(tensor)?))
    }
}

pub struct PthWeightManager {
    prefix: Option<String>,
    pth_tensors: Arc<candle_core::pickle::PthTensors>,
}

impl PthWeightManager {
    pub fn new(pth_tensors: Arc<candle_core::pickle::PthTensors>) -> Self {
        Self { prefix: None, pth_tensors }
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(scoped_name(self.prefix.as_deref(), name)),
            pth_tensors: self.pth_tensors.clone(),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let name = scoped_name(self.prefix.as_deref(), name);
        let tensor_info = self.pth_tensors.tensor_infos().get(&name).ok_or(Error::NoSuchTensorError(name))?;
        Ok(PthTensor::new(tensor_info.clone(), self.pth_tensors.clone())?)
    }

    fn has_tensor(&self, name: &str) -> bool {
        self.pth_tensors.tensor_infos().contains_key(&scoped_name(self.prefix.as_deref(), name))
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pth_tensors.tensor_infos().keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct SafetensorsWeightManagerInner {
    safetensors_files: Vec<Arc<Mmap>>,
    safetensors_metadata: Vec<Metadata>,
}

impl SafetensorsWeightManagerInner {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        let mut safetensors_metadata = vec![];
        for safetensors_mmap in &safetensors_files {
            let (_, metadata) = SafeTensors::read_metadata(safetensors_mmap)?;
            safetensors_metadata.push(metadata);
        }
        Ok(Self { safetensors_files, safetensors_metadata })
    }

    pub fn get_tensor_info(&self, name: &str) -> Option<(usize, TensorInfo)> {
        self.safetensors_metadata
            .iter()
            .enumerate()
            .find_map(|(i, metadata)| metadata.info(name).map(|info| (i, info.clone())))
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.safetensors_metadata.iter().flat_map(|m| m.tensors().into_keys()).collect();
        out.sort();
        out
    }
}

pub struct SafetensorsWeightManager {
    prefix: Option<String>,
    inner: Arc<SafetensorsWeightManagerInner>,
}

impl SafetensorsWeightManager {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        Ok(Self {
            prefix: None,
            inner: Arc::new(SafetensorsWeightManagerInner::new(safetensors_files)?),
        })
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(scoped_name(self.prefix.as_deref(), name)),
            inner: self.inner.clone(),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let full_name = scoped_name(self.prefix.as_deref(), name);
        Ok(Arc::new(SafetensorsTensor::new(self.inner.clone(), full_name)?))
    }

    fn has_tensor(&self, name: &str) -> bool {
        self.inner.get_tensor_info(&scoped_name(self.prefix.as_deref(), name)).is_some()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        self.inner.get_tensor_names()
    }
}

pub struct SafetensorsTensor {
    name: String,
    inner: Arc<SafetensorsWeightManagerInner>,
    file_index: usize,
    data_type: DType,
    shape: Shape,
}

impl SafetensorsTensor {
    pub fn new(inner: Arc<SafetensorsWeightManagerInner>, name: String) -> Result<Self, Error> {
        let (file_index, tensor_info) = inner.get_tensor_info(&name).ok_or_else(|| Error::NoSuchTensorError(name.clone()))?;
        let data_type = DType::from_safetensors(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.shape.clone());
        Ok(Self { name, inner, file_index, data_type, shape })
    }
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        false
    }

    fn is_weight(&self) -> bool {
        true
    }

    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        let st = SafeTensors::deserialize(&self.inner.safetensors_files[self.file_index])?;
        let view = st.tensor(&self.name)?;
        Ok(Some(TensorData::from_safetensors_view(view)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_checkpoint(dir: &Path) -> PathBuf {
        let values: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        let halves: Vec<u8> = [0.5f32, -1.0].iter().flat_map(|x| half::f16::from_f32(*x).to_le_bytes()).collect();
        let views = vec![
            ("encoder.block.0.layer.0.SelfAttention.q.weight", safetensors::tensor::TensorView::new(safetensors::Dtype::F32, vec![2, 3], &values).unwrap()),
            ("encoder.final_layer_norm.weight", safetensors::tensor::TensorView::new(safetensors::Dtype::F16, vec![2], &halves).unwrap()),
        ];
        let bytes = safetensors::serialize(views, &None).unwrap();
        let path = dir.join("model.safetensors");
        File::create(&path).unwrap().write_all(&bytes).unwrap();
        path
    }

    fn open(path: &Path) -> SafetensorsWeightManager {
        let file = File::open(path).unwrap();
        let mmap = unsafe { Mmap::map(&file) }.unwrap();
        SafetensorsWeightManager::new(vec![Arc::new(mmap)]).unwrap()
    }

    #[test]
    fn prefixes_compose() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&write_checkpoint(dir.path()));
        let attention = manager.prefix("encoder").prefix("block.0").prefix("layer.0.SelfAttention").prefix("q");
        assert_eq!(attention.get_prefix(), Some("encoder.block.0.layer.0.SelfAttention.q"));
        let weight = attention.get_tensor("weight").unwrap();
        assert_eq!(weight.shape().resolve().unwrap(), vec![2, 3]);
        assert!(weight.is_weight());
        assert!(!attention.has_tensor("bias"));
        assert!(matches!(attention.get_tensor("bias"), Err(Error::NoSuchTensorError(_))));
    }

    #[test]
    fn half_weights_load_as_f32() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&write_checkpoint(dir.path()));
        let norm = manager.prefix("encoder.final_layer_norm").get_tensor("weight").unwrap();
        assert_eq!(norm.dtype(), DType::F32);
        let data = norm.load_data().unwrap().unwrap();
        assert_eq!(data.value(), &super::super::tensor::TensorDataValue::F32(vec![0.5, -1.0]));
        assert_eq!(manager.get_tensor_names().len(), 2);
    }
}
