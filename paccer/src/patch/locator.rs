use crate::{
    dex::{DexFile, MethodRecord},
    types::PatchRequest,
};

/// First method, in declaration order, that `request` can be applied to.
pub fn find<'a>(dex: &'a DexFile, request: &PatchRequest) -> Option<MethodRecord<'a>> {
    dex.method_records().find(|record| matches(record, request))
}

pub fn matches(record: &MethodRecord, request: &PatchRequest) -> bool {
    record.name == request.method_name
        && record.return_type == request.behavior.required_return_type()
        && request
            .declaring_type
            .as_ref()
            .map_or(true, |declaring| record.declaring_type == declaring.as_str())
        && request.parameter_types.as_ref().map_or(true, |params| {
            params.len() == record.parameter_types.len()
                && params
                    .iter()
                    .zip(&record.parameter_types)
                    .all(|(want, have)| want == have)
        })
        && record.has_body()
}
