#[only_sync]
fn read_internal<RI, FS, Acc>(
    op: &mut RegisterOperation<'_, RI, u8, FS, Acc>,
) -> Result<FS, RI::Error>
where
    RI: RegisterInterface<AddressType = u8>,
    FS: FieldSet,
    Acc: ReadCapability,
{
    op.read()
}

#[only_async]
async fn read_internal<RI, FS, Acc>(
    op: &mut RegisterOperation<'_, RI, u8, FS, Acc>,
) -> Result<FS, RI::Error>
where
    RI: RegisterInterface<AddressType = u8>,
    FS: FieldSet,
    Acc: ReadCapability,
{
    op.read_async().await
}

#[only_sync]
fn modify_internal<RI, FS, Acc, F>(
    op: &mut RegisterOperation<'_, RI, u8, FS, Acc>,
    f: F,
) -> Result<(), RI::Error>
where
    RI: RegisterInterface<AddressType = u8>,
    FS: FieldSet,
    Acc: ReadCapability + WriteCapability,
    F: FnOnce(&mut FS),
{
    op.modify(f)
}

#[only_async]
async fn modify_internal<RI, FS, Acc, F>(
    op: &mut RegisterOperation<'_, RI, u8, FS, Acc>,
    f: F,
) -> Result<(), RI::Error>
where
    RI: RegisterInterface<AddressType = u8>,
    FS: FieldSet,
    Acc: ReadCapability + WriteCapability,
    F: FnOnce(&mut FS),
{
    op.modify_async(f).await
}
